//! Rules as authored: source text plus scope, context and lifecycle data.

use crate::dsl::{self, Expr};
use crate::error::CompileError;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use super::config::DEFAULT_MAX_RULE_LENGTH;
use super::schema::FieldSchema;

/// Stable identifier of a rule across versions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleId(String);

impl RuleId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RuleId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for RuleId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// What a rule is attached to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleScope {
    /// A single field; the field is the implicit subject of the rule text.
    Field(String),
    /// Several fields of one record; failures are reported against `anchor`.
    CrossField { anchor: String },
    /// The dataset as a whole (batch only).
    Dataset,
}

impl RuleScope {
    /// The field a subject-less condition (`between 1 and 2`) applies to.
    pub fn subject(&self) -> Option<&str> {
        match self {
            RuleScope::Field(field) => Some(field),
            RuleScope::CrossField { anchor } => Some(anchor),
            RuleScope::Dataset => None,
        }
    }
}

/// Where a rule runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionContext {
    RealTime,
    Batch,
    Both,
}

impl ExecutionContext {
    pub fn includes_realtime(self) -> bool {
        matches!(self, ExecutionContext::RealTime | ExecutionContext::Both)
    }

    pub fn includes_batch(self) -> bool {
        matches!(self, ExecutionContext::Batch | ExecutionContext::Both)
    }
}

/// Severity of a rule, copied onto the violations it produces.
///
/// Ordered by importance: `Error > Warning > Info`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    #[default]
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "INFO"),
            Severity::Warning => write!(f, "WARNING"),
            Severity::Error => write!(f, "ERROR"),
        }
    }
}

/// Flags a field whose value changes between two visits of the same subject
/// by more than `tolerance`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossVisitCheck {
    pub field: String,
    pub tolerance: f64,
}

/// Flags values further than `k` standard deviations from the population mean,
/// optionally computed per partition (e.g. per visit).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutlierCheck {
    pub field: String,
    pub k: f64,
    pub partition_by: Option<String>,
}

/// Flags subject × visit combinations with no submitted record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissingDataCheck {
    pub required_visits: Vec<String>,
}

/// The shape of a rule: DSL text, or one of the batch query templates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum RuleKind {
    Expression,
    CrossVisit(CrossVisitCheck),
    Outlier(OutlierCheck),
    MissingData(MissingDataCheck),
}

/// A data-quality rule.
///
/// Rules are immutable values: saving new text produces a new version via
/// [`Rule::revise`], and deactivation produces a retired version via
/// [`Rule::retire`]. The parsed AST is cached per rule value.
///
/// # Examples
///
/// ```rust
/// use qc_guard::core::{ExecutionContext, FieldSchema, FieldType, Rule};
///
/// let schema = FieldSchema::new().field("heart_rate", FieldType::Number);
/// let rule = Rule::for_field("hr-range", "heart_rate", "between 40 and 200")
///     .with_context(ExecutionContext::Both);
///
/// assert!(rule.ast(&schema).is_ok());
/// let v2 = rule.revise("between 30 and 220");
/// assert_eq!(v2.version, 2);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: RuleId,
    pub version: u32,
    pub source: String,
    pub scope: RuleScope,
    pub context: ExecutionContext,
    pub active: bool,
    #[serde(default)]
    pub severity: Severity,
    /// Failure message template; `{field}`, `{value}` and `{rule}` are substituted.
    #[serde(default)]
    pub message: Option<String>,
    pub kind: RuleKind,
    #[serde(skip)]
    ast: OnceCell<ParsedAst>,
}

/// A parsed rule together with the inputs it was parsed under.
#[derive(Debug, Clone)]
struct ParsedAst {
    schema: FieldSchema,
    max_length: usize,
    expr: Arc<Expr>,
}

impl Rule {
    /// Creates an active, version-1 expression rule.
    pub fn new(id: impl Into<RuleId>, source: impl Into<String>, scope: RuleScope) -> Self {
        Self {
            id: id.into(),
            version: 1,
            source: source.into(),
            scope,
            context: ExecutionContext::Both,
            active: true,
            severity: Severity::default(),
            message: None,
            kind: RuleKind::Expression,
            ast: OnceCell::new(),
        }
    }

    /// Creates a rule attached to a single field.
    pub fn for_field(
        id: impl Into<RuleId>,
        field: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self::new(id, source, RuleScope::Field(field.into()))
    }

    /// Creates a batch-only cross-visit consistency rule.
    pub fn cross_visit(id: impl Into<RuleId>, field: impl Into<String>, tolerance: f64) -> Self {
        let field = field.into();
        let source = format!("{field} changes by at most {tolerance} between visits");
        Self::template(
            id,
            source,
            RuleScope::Field(field.clone()),
            RuleKind::CrossVisit(CrossVisitCheck { field, tolerance }),
        )
    }

    /// Creates a batch-only population outlier rule.
    pub fn outlier(
        id: impl Into<RuleId>,
        field: impl Into<String>,
        k: f64,
        partition_by: Option<String>,
    ) -> Self {
        let field = field.into();
        let source = format!("{field} within mean ± {k}·sd");
        Self::template(
            id,
            source,
            RuleScope::Field(field.clone()),
            RuleKind::Outlier(OutlierCheck {
                field,
                k,
                partition_by,
            }),
        )
    }

    /// Creates a batch-only missing-data rule.
    pub fn missing_data<I, S>(id: impl Into<RuleId>, required_visits: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let required_visits: Vec<String> = required_visits.into_iter().map(Into::into).collect();
        let source = format!("records present for visits {}", required_visits.join(", "));
        Self::template(
            id,
            source,
            RuleScope::Dataset,
            RuleKind::MissingData(MissingDataCheck { required_visits }),
        )
    }

    fn template(
        id: impl Into<RuleId>,
        source: String,
        scope: RuleScope,
        kind: RuleKind,
    ) -> Self {
        Self {
            context: ExecutionContext::Batch,
            kind,
            ..Self::new(id, source, scope)
        }
    }

    pub fn with_context(mut self, context: ExecutionContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Sets the version, e.g. when loading a stored rule.
    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Returns the next version of this rule with new source text.
    pub fn revise(&self, source: impl Into<String>) -> Self {
        Self {
            version: self.version + 1,
            source: source.into(),
            ast: OnceCell::new(),
            ..self.clone()
        }
    }

    /// Returns the next version of this rule, deactivated.
    pub fn retire(&self) -> Self {
        Self {
            version: self.version + 1,
            active: false,
            ..self.clone()
        }
    }

    /// The field failures of this rule are reported against, if any.
    pub fn target_field(&self) -> Option<&str> {
        self.scope.subject()
    }

    /// Parses the rule text, caching the AST on success.
    ///
    /// The cache holds the first successful parse; a call with another
    /// schema or length limit parses afresh without replacing it.
    ///
    /// Template rules have no DSL text and report `Unsupported`.
    pub fn ast(&self, schema: &FieldSchema) -> Result<Arc<Expr>, CompileError> {
        self.ast_with_limit(schema, DEFAULT_MAX_RULE_LENGTH)
    }

    /// Like [`Rule::ast`], rejecting rule text longer than `max_length` characters.
    pub fn ast_with_limit(
        &self,
        schema: &FieldSchema,
        max_length: usize,
    ) -> Result<Arc<Expr>, CompileError> {
        if self.kind != RuleKind::Expression {
            return Err(CompileError::unsupported(
                "parser",
                "template rules are not written in the rule language",
            ));
        }
        let parse = || {
            dsl::parse_rule_with_limit(&self.source, schema, self.scope.subject(), max_length)
                .map(Arc::new)
        };
        let cached = self.ast.get_or_try_init(|| {
            parse().map(|expr| ParsedAst {
                schema: schema.clone(),
                max_length,
                expr,
            })
        })?;
        if cached.max_length == max_length && cached.schema == *schema {
            Ok(cached.expr.clone())
        } else {
            parse()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::FieldType;

    fn schema() -> FieldSchema {
        FieldSchema::new()
            .field("heart_rate", FieldType::Number)
            .field("weight", FieldType::Number)
    }

    #[test]
    fn test_revise_bumps_version_and_drops_ast() {
        let rule = Rule::for_field("r1", "heart_rate", "between 40 and 200");
        rule.ast(&schema()).unwrap();
        let revised = rule.revise("between 40 and");
        assert_eq!(revised.version, 2);
        assert_eq!(revised.id, rule.id);
        assert!(revised.ast(&schema()).is_err());
    }

    #[test]
    fn test_retire_deactivates() {
        let rule = Rule::for_field("r1", "heart_rate", "> 0");
        let retired = rule.retire();
        assert!(!retired.active);
        assert_eq!(retired.version, 2);
        assert_eq!(retired.source, rule.source);
    }

    #[test]
    fn test_ast_is_cached() {
        let rule = Rule::for_field("r1", "heart_rate", "between 40 and 200");
        let a = rule.ast(&schema()).unwrap();
        let b = rule.ast(&schema()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_ast_cache_is_keyed_on_schema_and_limit() {
        let rule = Rule::for_field("r1", "heart_rate", "between 40 and 200");
        let first = rule.ast(&schema()).unwrap();

        let err = rule.ast_with_limit(&schema(), 5).unwrap_err();
        assert!(matches!(err, CompileError::Lex(_)));

        let other = FieldSchema::new().field("weight", FieldType::Number);
        assert!(rule.ast(&other).is_err());

        let again = rule.ast(&schema()).unwrap();
        assert!(Arc::ptr_eq(&first, &again));
    }

    #[test]
    fn test_default_severity_is_error() {
        assert_eq!(Severity::default(), Severity::Error);
        let rule = Rule::for_field("r1", "heart_rate", "> 0");
        assert_eq!(rule.severity, Severity::Error);
    }

    #[test]
    fn test_template_rules_are_batch_only() {
        let rule = Rule::cross_visit("cv", "weight", 5.0);
        assert_eq!(rule.context, ExecutionContext::Batch);
        assert!(rule.ast(&schema()).is_err());

        let rule = Rule::missing_data("md", ["V1", "V2"]);
        assert_eq!(rule.scope, RuleScope::Dataset);
        assert!(rule.target_field().is_none());
    }

    #[test]
    fn test_rule_serde_round_trip_skips_ast() {
        let rule = Rule::outlier("o1", "weight", 3.0, Some("visit".into()))
            .with_severity(Severity::Warning);
        let json = serde_json::to_string(&rule).unwrap();
        let back: Rule = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind, rule.kind);
        assert_eq!(back.severity, Severity::Warning);
    }
}
