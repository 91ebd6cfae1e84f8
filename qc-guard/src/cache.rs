//! Process-wide, hot-reloadable table of compiled real-time validators.
//!
//! The cache holds one immutable [`CacheSnapshot`] behind a swappable
//! reference. `refresh` builds a complete new snapshot off to the side and
//! publishes it with a single pointer swap, so a `validate_record` call sees
//! either the old rule set or the new one, never a mix.
//!
//! A rule that fails to recompile keeps its previously published validator;
//! the error is returned in the [`RefreshReport`] for the author to fix.
//!
//! # Examples
//!
//! ```rust
//! use qc_guard::cache::ValidatorCache;
//! use qc_guard::core::{FieldSchema, FieldType, QcConfig, Record, Rule};
//!
//! let schema = FieldSchema::new().field("heart_rate", FieldType::Number);
//! let rules = vec![Rule::for_field("hr", "heart_rate", "between 40 and 200")];
//! let cache = ValidatorCache::load(schema, QcConfig::default(), &rules);
//!
//! let failures = cache.validate_record(["heart_rate"], &Record::new().with("heart_rate", 39));
//! assert!(failures.contains_key("heart_rate"));
//! ```

use crate::compile::{compile_rule, CompiledValidator};
use crate::core::{FieldSchema, QcConfig, Record, Rule, RuleId};
use crate::error::CompileError;
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, info, instrument, warn};

/// A compiled rule as published in a snapshot.
#[derive(Debug, Clone)]
pub struct CachedRule {
    pub version: u32,
    /// Field the validator reports against, if the rule touches any field.
    pub field: Option<String>,
    pub validator: CompiledValidator,
}

/// One immutable generation of the cache.
#[derive(Debug, Default)]
pub struct CacheSnapshot {
    version: u64,
    schema: Arc<FieldSchema>,
    rules: IndexMap<RuleId, CachedRule>,
    fields: HashMap<String, CompiledValidator>,
}

impl CacheSnapshot {
    fn build(version: u64, schema: Arc<FieldSchema>, rules: IndexMap<RuleId, CachedRule>) -> Self {
        let mut grouped: IndexMap<String, Vec<&CompiledValidator>> = IndexMap::new();
        for cached in rules.values() {
            if let Some(field) = &cached.field {
                grouped
                    .entry(field.clone())
                    .or_default()
                    .push(&cached.validator);
            }
        }
        let fields = grouped
            .into_iter()
            .map(|(field, validators)| (field, CompiledValidator::combine(validators)))
            .collect();
        Self {
            version,
            schema,
            rules,
            fields,
        }
    }

    /// Monotonic generation number; 0 for an empty cache.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    pub fn schema(&self) -> &FieldSchema {
        &self.schema
    }

    /// Looks up a cached rule by id.
    pub fn rule(&self, id: &RuleId) -> Option<&CachedRule> {
        self.rules.get(id)
    }

    /// Fields with at least one validator.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }
}

/// What happened to one rule during a refresh.
#[derive(Debug, Clone, PartialEq)]
pub enum RefreshOutcome {
    /// Compiled and published.
    Compiled { version: u32 },
    /// Failed to compile; the previously published version stays in effect.
    Retained { version: u32, error: CompileError },
    /// Failed to compile and nothing was cached for it before.
    Rejected { error: CompileError },
    /// No longer active for real-time validation; removed.
    Dropped,
}

/// Per-rule results of a refresh.
#[derive(Debug, Clone)]
pub struct RefreshReport {
    /// Version of the snapshot that was published.
    pub version: u64,
    pub outcomes: IndexMap<RuleId, RefreshOutcome>,
}

impl RefreshReport {
    /// Compile errors keyed by rule id.
    pub fn errors(&self) -> impl Iterator<Item = (&RuleId, &CompileError)> {
        self.outcomes.iter().filter_map(|(id, outcome)| match outcome {
            RefreshOutcome::Retained { error, .. } | RefreshOutcome::Rejected { error } => {
                Some((id, error))
            }
            RefreshOutcome::Compiled { .. } | RefreshOutcome::Dropped => None,
        })
    }

    pub fn is_clean(&self) -> bool {
        self.errors().next().is_none()
    }
}

/// Hot-reloadable validator table.
#[derive(Debug)]
pub struct ValidatorCache {
    current: RwLock<Arc<CacheSnapshot>>,
    /// Serializes writers; readers never take it.
    refresh_lock: Mutex<()>,
    config: QcConfig,
}

impl Default for ValidatorCache {
    fn default() -> Self {
        Self::new(FieldSchema::new(), QcConfig::default())
    }
}

impl ValidatorCache {
    /// Creates an empty cache.
    pub fn new(schema: FieldSchema, config: QcConfig) -> Self {
        let snapshot = CacheSnapshot {
            schema: Arc::new(schema),
            ..CacheSnapshot::default()
        };
        Self {
            current: RwLock::new(Arc::new(snapshot)),
            refresh_lock: Mutex::new(()),
            config,
        }
    }

    /// Creates a cache and compiles `active_rules` into it.
    ///
    /// Compile failures are logged; call [`refresh`](Self::refresh) to get the
    /// report instead.
    pub fn load(schema: FieldSchema, config: QcConfig, active_rules: &[Rule]) -> Self {
        let cache = Self::new(schema, config);
        let report = cache.refresh(active_rules);
        for (id, error) in report.errors() {
            warn!(rule.id = %id, error = %error, "Rule not loaded into validator cache");
        }
        cache
    }

    /// The current snapshot. Holding it pins one consistent rule set.
    pub fn snapshot(&self) -> Arc<CacheSnapshot> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Validator for a field (all of its rules combined) or, failing that, a rule id.
    pub fn get(&self, field_or_rule_id: &str) -> Option<CompiledValidator> {
        let snapshot = self.snapshot();
        snapshot.fields.get(field_or_rule_id).cloned().or_else(|| {
            snapshot
                .rules
                .get(&RuleId::new(field_or_rule_id))
                .map(|cached| cached.validator.clone())
        })
    }

    /// Recompiles the active rule set against the current schema and publishes it.
    pub fn refresh(&self, active_rules: &[Rule]) -> RefreshReport {
        self.publish(None, active_rules)
    }

    /// Like [`refresh`](Self::refresh), also replacing the field schema.
    pub fn refresh_with_schema(&self, schema: FieldSchema, active_rules: &[Rule]) -> RefreshReport {
        self.publish(Some(schema), active_rules)
    }

    #[instrument(skip_all, fields(rules = active_rules.len()))]
    fn publish(&self, schema: Option<FieldSchema>, active_rules: &[Rule]) -> RefreshReport {
        let _writer = self
            .refresh_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let previous = self.snapshot();
        let schema = schema.map_or_else(|| previous.schema.clone(), Arc::new);

        let mut rules = IndexMap::new();
        let mut outcomes = IndexMap::new();
        for rule in active_rules
            .iter()
            .filter(|r| r.active && r.context.includes_realtime())
        {
            let outcome = match compile_rule(rule, &schema, self.config.max_rule_length) {
                Ok(validator) => {
                    rules.insert(
                        rule.id.clone(),
                        CachedRule {
                            version: rule.version,
                            field: report_field(rule, &schema),
                            validator,
                        },
                    );
                    RefreshOutcome::Compiled {
                        version: rule.version,
                    }
                }
                Err(error) => {
                    warn!(rule.id = %rule.id, rule.version = rule.version, error = %error, "Rule failed to compile");
                    match previous.rules.get(&rule.id) {
                        Some(old) => {
                            rules.insert(rule.id.clone(), old.clone());
                            RefreshOutcome::Retained {
                                version: old.version,
                                error,
                            }
                        }
                        None => RefreshOutcome::Rejected { error },
                    }
                }
            };
            outcomes.insert(rule.id.clone(), outcome);
        }
        for id in previous.rules.keys() {
            if !outcomes.contains_key(id) {
                debug!(rule.id = %id, "Rule dropped from validator cache");
                outcomes.insert(id.clone(), RefreshOutcome::Dropped);
            }
        }

        let version = previous.version + 1;
        let next = Arc::new(CacheSnapshot::build(version, schema, rules));
        let rule_count = next.rule_count();
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = next;
        info!(cache.version = version, rule_count, "Validator cache published");

        RefreshReport { version, outcomes }
    }

    /// Validates the submitted fields of a record.
    ///
    /// Only validators for `form_fields` run, in that order. Every failing
    /// field is reported; an empty map means the record passed.
    pub fn validate_record<I, S>(&self, form_fields: I, record: &Record) -> IndexMap<String, String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let snapshot = self.snapshot();
        let today = self.config.today();
        let mut failures = IndexMap::new();
        for field in form_fields {
            let field = field.as_ref();
            let Some(validator) = snapshot.fields.get(field) else {
                continue;
            };
            let outcome = validator.evaluate_at(record, today);
            if !outcome.passed {
                failures.insert(
                    field.to_string(),
                    outcome
                        .message
                        .unwrap_or_else(|| format!("{field} is invalid")),
                );
            }
        }
        failures
    }
}

/// The field a rule's failures are reported under: its target, or else the
/// first field its text reads.
fn report_field(rule: &Rule, schema: &FieldSchema) -> Option<String> {
    if let Some(field) = rule.target_field() {
        return Some(field.to_string());
    }
    rule.ast(schema)
        .ok()
        .and_then(|expr| expr.referenced_fields().first().map(|f| f.to_string()))
}

static GLOBAL: Lazy<ValidatorCache> = Lazy::new(ValidatorCache::default);

/// The process-wide cache. Starts empty; populate it with
/// [`ValidatorCache::refresh_with_schema`].
pub fn global() -> &'static ValidatorCache {
    &GLOBAL
}
