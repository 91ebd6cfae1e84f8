//! In-memory implementation of ViolationRepository for testing and development.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::core::{QcViolation, Resolution, RuleId, Severity};
use crate::engine::RunReport;
use crate::error::{QcError, Result};

use super::{UpsertSummary, ViolationFilter, ViolationRepository};

const BACKEND: &str = "in_memory";

#[derive(Default)]
struct Store {
    violations: IndexMap<Uuid, QcViolation>,
    /// Open violations by rule and record ids.
    open: HashMap<(RuleId, Vec<String>), Uuid>,
    runs: Vec<RunReport>,
}

/// Violation storage held in process memory.
///
/// Clones share the same storage.
///
/// # Example
///
/// ```rust
/// use chrono::Utc;
/// use qc_guard::core::{RuleId, Severity};
/// use qc_guard::repository::{InMemoryViolationRepository, ViolationFilter, ViolationRepository};
///
/// # #[tokio::main]
/// # async fn main() -> qc_guard::error::Result<()> {
/// let repository = InMemoryViolationRepository::new();
/// let rule = RuleId::new("hr-range");
/// let detections = vec![vec!["r1".to_string()]];
///
/// let first = repository.upsert_detections(&rule, Severity::Error, detections.clone(), Utc::now()).await?;
/// let second = repository.upsert_detections(&rule, Severity::Error, detections, Utc::now()).await?;
/// assert_eq!((first.created, second.created, second.touched), (1, 0, 1));
/// assert_eq!(repository.find(&ViolationFilter::all()).await?.len(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct InMemoryViolationRepository {
    store: Arc<RwLock<Store>>,
}

impl InMemoryViolationRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored violations, open or resolved.
    pub async fn size(&self) -> usize {
        self.store.read().await.violations.len()
    }

    /// Number of open violations.
    pub async fn open_count(&self) -> usize {
        self.store.read().await.open.len()
    }
}

#[async_trait]
impl ViolationRepository for InMemoryViolationRepository {
    #[instrument(skip(self, detections), fields(rule.id = %rule_id, detections = detections.len(), repository_type = "in_memory"))]
    async fn upsert_detections(
        &self,
        rule_id: &RuleId,
        severity: Severity,
        detections: Vec<Vec<String>>,
        seen_at: DateTime<Utc>,
    ) -> Result<UpsertSummary> {
        let mut guard = self.store.write().await;
        let store = &mut *guard;
        let mut summary = UpsertSummary::default();
        for record_ids in detections {
            let key = (rule_id.clone(), record_ids);
            let existing = store.open.get(&key).copied();
            match existing.and_then(|id| store.violations.get_mut(&id)) {
                Some(violation) => {
                    violation.touch(seen_at);
                    summary.touched += 1;
                }
                None => {
                    let violation =
                        QcViolation::open(rule_id.clone(), key.1.clone(), severity, seen_at);
                    store.open.insert(key, violation.id);
                    store.violations.insert(violation.id, violation);
                    summary.created += 1;
                }
            }
        }
        debug!(created = summary.created, touched = summary.touched, "Detections stored");
        Ok(summary)
    }

    #[instrument(skip(self))]
    async fn find(&self, filter: &ViolationFilter) -> Result<Vec<QcViolation>> {
        let store = self.store.read().await;
        Ok(store
            .violations
            .values()
            .filter(|v| filter.matches(v))
            .cloned()
            .collect())
    }

    #[instrument(skip(self, resolution), fields(resolved_by = %resolution.resolved_by))]
    async fn resolve(&self, id: Uuid, resolution: Resolution) -> Result<QcViolation> {
        let mut store = self.store.write().await;
        let violation = store
            .violations
            .get_mut(&id)
            .ok_or_else(|| QcError::storage(BACKEND, "resolve", format!("Violation not found: {id}")))?;
        if !violation.is_open() {
            return Err(QcError::storage(
                BACKEND,
                "resolve",
                format!("Violation already resolved: {id}"),
            ));
        }
        violation.resolve(resolution);
        let resolved = violation.clone();
        store
            .open
            .remove(&(resolved.rule_id.clone(), resolved.record_ids.clone()));
        Ok(resolved)
    }

    #[instrument(skip(self, report), fields(run.id = %report.run_id))]
    async fn append_run(&self, report: RunReport) -> Result<()> {
        self.store.write().await.runs.push(report);
        Ok(())
    }

    async fn runs(&self) -> Result<Vec<RunReport>> {
        Ok(self.store.read().await.runs.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ViolationStatus;
    use chrono::Duration;

    fn ids(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent_per_rule_and_record() {
        let repo = InMemoryViolationRepository::new();
        let rule = RuleId::new("r");
        let t0 = Utc::now();
        let t1 = t0 + Duration::minutes(5);

        let first = repo
            .upsert_detections(&rule, Severity::Error, vec![ids(&["a"]), ids(&["b"])], t0)
            .await
            .unwrap();
        assert_eq!(first, UpsertSummary { created: 2, touched: 0 });

        let second = repo
            .upsert_detections(&rule, Severity::Error, vec![ids(&["a"])], t1)
            .await
            .unwrap();
        assert_eq!(second, UpsertSummary { created: 0, touched: 1 });

        let open = repo
            .find(&ViolationFilter::all().with_status(ViolationStatus::Open))
            .await
            .unwrap();
        assert_eq!(open.len(), 2);
        assert_eq!(open[0].last_seen, t1);
        assert_eq!(open[0].detected_at, t0);
    }

    #[tokio::test]
    async fn test_same_record_under_other_rule_is_separate() {
        let repo = InMemoryViolationRepository::new();
        let now = Utc::now();
        for rule in ["r1", "r2"] {
            repo.upsert_detections(&RuleId::new(rule), Severity::Warning, vec![ids(&["a"])], now)
                .await
                .unwrap();
        }
        assert_eq!(repo.size().await, 2);
        let r1 = repo.find(&ViolationFilter::all().for_rule("r1")).await.unwrap();
        assert_eq!(r1.len(), 1);
        assert_eq!(r1[0].severity, Severity::Warning);
    }

    #[tokio::test]
    async fn test_resolved_violation_reopens_as_new() {
        let repo = InMemoryViolationRepository::new();
        let rule = RuleId::new("r");
        repo.upsert_detections(&rule, Severity::Error, vec![ids(&["a"])], Utc::now())
            .await
            .unwrap();
        let id = repo.find(&ViolationFilter::all()).await.unwrap()[0].id;

        let resolved = repo
            .resolve(id, Resolution::new("monitor").with_comment("source verified"))
            .await
            .unwrap();
        assert_eq!(resolved.status, ViolationStatus::Resolved);
        assert!(repo.resolve(id, Resolution::new("monitor")).await.is_err());
        assert_eq!(repo.open_count().await, 0);

        let again = repo
            .upsert_detections(&rule, Severity::Error, vec![ids(&["a"])], Utc::now())
            .await
            .unwrap();
        assert_eq!(again.created, 1);
        assert_eq!(repo.size().await, 2);
    }

    #[tokio::test]
    async fn test_resolve_unknown_id() {
        let repo = InMemoryViolationRepository::new();
        let err = repo
            .resolve(Uuid::new_v4(), Resolution::new("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, QcError::Storage { .. }));
    }

    #[tokio::test]
    async fn test_run_history() {
        let repo = InMemoryViolationRepository::new();
        repo.append_run(RunReport::begin("d").finish(vec![], false))
            .await
            .unwrap();
        repo.append_run(RunReport::begin("d").finish(vec![], true))
            .await
            .unwrap();
        let runs = repo.runs().await.unwrap();
        assert_eq!(runs.len(), 2);
        assert!(runs[0].started_at <= runs[1].started_at);
    }
}
