//! The QC execution engine: runs batch rules against a dataset and records
//! violations.
//!
//! A run is exclusive per dataset. Rule queries run concurrently up to the
//! configured worker bound; their results are persisted by the single task
//! driving the run, one repository call per rule, so writes never interleave.
//! A failing rule becomes a failed entry in the [`RunReport`] and the other
//! rules continue. Cancellation is checked before each rule starts; a
//! cancelled run still ends with a report in the history.

mod lock;
mod report;

pub use lock::{DatasetGuard, DatasetLocks};
pub use report::{RuleOutcome, RuleRunEntry, RunReport, RunStatus};

use crate::compile::{
    compile_batch_rule, FragmentKind, QueryFragment, RECORD_ID_COLUMN, RELATED_ID_COLUMN,
};
use crate::core::{FieldSchema, QcConfig, Rule};
use crate::error::{QcError, Result};
use crate::logging::truncate_field;
use crate::repository::ViolationRepository;
use crate::sources::Dataset;
use arrow::array::{Array, AsArray};
use arrow::compute::cast;
use arrow::datatypes::DataType;
use arrow::record_batch::RecordBatch;
use chrono::{NaiveDate, Utc};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn, Span};

/// Result of running one rule's query, before persistence.
enum Attempt {
    Detected {
        kind: FragmentKind,
        detections: Vec<Vec<String>>,
    },
    Failed {
        kind: Option<FragmentKind>,
        error: QcError,
    },
    Skipped,
}

/// Runs batch rules and persists their findings.
///
/// # Examples
///
/// ```rust
/// use std::sync::Arc;
/// use qc_guard::core::{FieldSchema, FieldType, QcConfig, Record, Rule};
/// use qc_guard::engine::{QcEngine, RunStatus};
/// use qc_guard::repository::InMemoryViolationRepository;
/// use qc_guard::sources::SessionDataset;
///
/// # #[tokio::main]
/// # async fn main() -> qc_guard::error::Result<()> {
/// let schema = FieldSchema::new().field("heart_rate", FieldType::Number);
/// let records = vec![
///     Record::new().with("record_id", "r1").with("heart_rate", 39),
///     Record::new().with("record_id", "r2").with("heart_rate", 72),
/// ];
/// let dataset = SessionDataset::from_records("doc-trial", "data", &schema, &records).await?;
/// let repository = Arc::new(InMemoryViolationRepository::new());
/// let engine = QcEngine::new(schema, repository.clone(), QcConfig::default());
///
/// let rules = vec![Rule::for_field("hr", "heart_rate", "between 40 and 200")];
/// let report = engine.run_batch(&rules, &dataset).await?;
/// assert_eq!(report.status, RunStatus::Completed);
/// assert_eq!(report.created(), 1);
/// # Ok(())
/// # }
/// ```
pub struct QcEngine {
    schema: Arc<FieldSchema>,
    repository: Arc<dyn ViolationRepository>,
    config: QcConfig,
    locks: Arc<DatasetLocks>,
}

impl QcEngine {
    pub fn new(
        schema: FieldSchema,
        repository: Arc<dyn ViolationRepository>,
        config: QcConfig,
    ) -> Self {
        Self {
            schema: Arc::new(schema),
            repository,
            config,
            locks: DatasetLocks::shared(),
        }
    }

    /// Uses a private lock set instead of the process-wide one.
    pub fn with_locks(mut self, locks: Arc<DatasetLocks>) -> Self {
        self.locks = locks;
        self
    }

    pub fn config(&self) -> &QcConfig {
        &self.config
    }

    /// Runs every active batch rule against `dataset`.
    pub async fn run_batch(&self, active_rules: &[Rule], dataset: &dyn Dataset) -> Result<RunReport> {
        let (_cancel, cancelled) = watch::channel(false);
        self.run_batch_with_cancel(active_rules, dataset, cancelled).await
    }

    /// Like [`run_batch`](Self::run_batch), stopping before the next rule once
    /// `cancel` reads `true`.
    ///
    /// Fails only if another run holds the dataset or the report cannot be
    /// stored; per-rule failures, including an unreadable dataset, are
    /// entries in the returned report.
    #[instrument(
        skip_all,
        fields(dataset.name = %dataset.name(), run.id = tracing::field::Empty, rules = active_rules.len())
    )]
    pub async fn run_batch_with_cancel(
        &self,
        active_rules: &[Rule],
        dataset: &dyn Dataset,
        cancel: watch::Receiver<bool>,
    ) -> Result<RunReport> {
        let _guard = self.locks.try_acquire(dataset.name())?;
        let report = RunReport::begin(dataset.name());
        Span::current().record("run.id", tracing::field::display(report.run_id));

        let rules: Vec<&Rule> = active_rules
            .iter()
            .filter(|r| r.active && r.context.includes_batch())
            .collect();
        let today = self.config.today();
        let rows_scanned = match dataset.row_count().await {
            Ok(rows) => Some(rows),
            Err(error) => {
                warn!(error = %error, "Row count unavailable");
                None
            }
        };
        info!(batch_rules = rules.len(), rows_scanned = ?rows_scanned, %today, "QC run started");

        let cancel = &cancel;
        let mut attempts = stream::iter(rules.iter().enumerate())
            .map(|(index, rule)| async move {
                let started = Instant::now();
                let stop = *cancel.borrow();
                let attempt = if stop {
                    Attempt::Skipped
                } else {
                    self.attempt(rule, dataset, today).await
                };
                (index, started, attempt)
            })
            .buffer_unordered(self.config.workers());

        let mut entries: Vec<Option<RuleRunEntry>> = vec![None; rules.len()];
        let mut cancelled = false;
        while let Some((index, started, attempt)) = attempts.next().await {
            let rule = rules[index];
            let (kind, outcome) = match attempt {
                Attempt::Skipped => {
                    cancelled = true;
                    (None, RuleOutcome::Skipped)
                }
                Attempt::Failed { kind, error } => {
                    warn!(rule.id = %rule.id, error = %error, "Batch rule failed");
                    (
                        kind,
                        RuleOutcome::Failed {
                            error: error.to_string(),
                        },
                    )
                }
                Attempt::Detected { kind, detections } => {
                    let detected = detections.len();
                    let outcome = match self
                        .repository
                        .upsert_detections(&rule.id, rule.severity, detections, Utc::now())
                        .await
                    {
                        Ok(summary) => RuleOutcome::Succeeded {
                            rows_scanned,
                            detected,
                            created: summary.created,
                            touched: summary.touched,
                        },
                        Err(error) => {
                            warn!(rule.id = %rule.id, error = %error, "Storing violations failed");
                            RuleOutcome::Failed {
                                error: error.to_string(),
                            }
                        }
                    };
                    (Some(kind), outcome)
                }
            };
            entries[index] = Some(RuleRunEntry {
                rule_id: rule.id.clone(),
                rule_version: rule.version,
                kind,
                outcome,
                duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            });
        }
        drop(attempts);

        let report = report.finish(entries.into_iter().flatten().collect(), cancelled);
        info!(
            status = ?report.status,
            created = report.created(),
            touched = report.touched(),
            failed = report.failed_rules().count(),
            "QC run finished"
        );
        self.repository.append_run(report.clone()).await?;
        Ok(report)
    }

    async fn attempt(&self, rule: &Rule, dataset: &dyn Dataset, today: NaiveDate) -> Attempt {
        let fragment = match compile_batch_rule(
            rule,
            &self.schema,
            self.config.max_rule_length,
            &self.config.log,
        ) {
            Ok(fragment) => fragment,
            Err(error) => {
                return Attempt::Failed {
                    kind: None,
                    error: QcError::compile(rule.id.as_str(), error),
                }
            }
        };
        let kind = fragment.kind;
        match self.detect(rule, &fragment, dataset, today).await {
            Ok(detections) => Attempt::Detected { kind, detections },
            Err(error) => Attempt::Failed {
                kind: Some(kind),
                error,
            },
        }
    }

    async fn detect(
        &self,
        rule: &Rule,
        fragment: &QueryFragment,
        dataset: &dyn Dataset,
        today: NaiveDate,
    ) -> Result<Vec<Vec<String>>> {
        let sql = fragment
            .render(dataset.table_name())
            .map_err(|e| QcError::compile(rule.id.as_str(), e))?;
        crate::log_sql!(
            self.config.log,
            rule.id = %rule.id,
            sql = %truncate_field(&sql, self.config.log.max_field_length),
            "Generated batch query"
        );
        let batches = dataset
            .query(&sql, fragment.bind(today))
            .await
            .map_err(|e| QcError::execution(rule.id.as_str(), e.to_string()))?;
        let detections = record_ids(&batches, fragment.has_related_id())?;
        crate::log_data_op!(
            self.config.log,
            rule.id = %rule.id,
            rows = detections.len(),
            "Batch rule evaluated"
        );
        Ok(detections)
    }
}

/// Reads the id columns of a violation query, one id list per row.
fn record_ids(batches: &[RecordBatch], related: bool) -> Result<Vec<Vec<String>>> {
    let mut detections = Vec::new();
    for batch in batches {
        let ids = id_column(batch, RECORD_ID_COLUMN)?;
        let related_ids = if related {
            Some(id_column(batch, RELATED_ID_COLUMN)?)
        } else {
            None
        };
        let ids = ids.as_string::<i32>();
        let related_ids = related_ids.as_ref().map(|a| a.as_string::<i32>());
        for row in 0..batch.num_rows() {
            if ids.is_null(row) {
                debug!(row, "Skipping violation row without a record id");
                continue;
            }
            let mut record = vec![ids.value(row).to_string()];
            if let Some(related) = related_ids {
                if !related.is_null(row) {
                    record.push(related.value(row).to_string());
                }
            }
            detections.push(record);
        }
    }
    Ok(detections)
}

fn id_column(batch: &RecordBatch, name: &str) -> Result<Arc<dyn Array>> {
    let column = batch
        .column_by_name(name)
        .ok_or_else(|| QcError::Internal(format!("query result has no '{name}' column")))?;
    Ok(cast(column, &DataType::Utf8)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ExecutionContext, FieldType, Record, RuleId, ViolationStatus};
    use crate::repository::{InMemoryViolationRepository, ViolationFilter};
    use crate::sources::SessionDataset;
    use async_trait::async_trait;
    use datafusion::scalar::ScalarValue;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn schema() -> FieldSchema {
        FieldSchema::new()
            .field("heart_rate", FieldType::Number)
            .field("weight", FieldType::Number)
    }

    async fn dataset(name: &str) -> SessionDataset {
        let records = vec![
            Record::new()
                .with("record_id", "r1")
                .with("subject_id", "S1")
                .with("visit", "V1")
                .with("heart_rate", 30)
                .with("weight", 70),
            Record::new()
                .with("record_id", "r2")
                .with("subject_id", "S1")
                .with("visit", "V2")
                .with("heart_rate", 80)
                .with("weight", 90),
        ];
        SessionDataset::from_records(name, "data", &schema(), &records)
            .await
            .unwrap()
    }

    /// Delegates to a session dataset while tracking concurrent queries.
    #[derive(Debug)]
    struct TrackedDataset {
        inner: SessionDataset,
        row_count_fails: bool,
        cancel_after_query: Option<watch::Sender<bool>>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl TrackedDataset {
        fn new(inner: SessionDataset) -> Self {
            Self {
                inner,
                row_count_fails: false,
                cancel_after_query: None,
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Dataset for TrackedDataset {
        fn name(&self) -> &str {
            self.inner.name()
        }

        fn table_name(&self) -> &str {
            self.inner.table_name()
        }

        async fn query(&self, sql: &str, params: Vec<ScalarValue>) -> Result<Vec<RecordBatch>> {
            let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(running, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            let batches = self.inner.query(sql, params).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if let Some(cancel) = &self.cancel_after_query {
                cancel.send_replace(true);
            }
            batches
        }

        async fn row_count(&self) -> Result<usize> {
            if self.row_count_fails {
                return Err(QcError::Internal("row count unavailable".to_string()));
            }
            self.inner.row_count().await
        }
    }

    fn engine(repository: Arc<InMemoryViolationRepository>) -> QcEngine {
        QcEngine::new(schema(), repository, QcConfig::default().with_max_workers(2))
            .with_locks(Arc::new(DatasetLocks::default()))
    }

    #[tokio::test]
    async fn test_run_is_idempotent() {
        let repository = Arc::new(InMemoryViolationRepository::new());
        let engine = engine(repository.clone());
        let data = dataset("idempotent").await;
        let rules = vec![
            Rule::for_field("hr", "heart_rate", "between 40 and 200"),
            Rule::cross_visit("wt", "weight", 10.0),
        ];

        let first = engine.run_batch(&rules, &data).await.unwrap();
        assert_eq!(first.status, RunStatus::Completed);
        assert_eq!(first.created(), 2);

        let second = engine.run_batch(&rules, &data).await.unwrap();
        assert_eq!(second.created(), 0);
        assert_eq!(second.touched(), 2);

        let open = repository
            .find(&ViolationFilter::all().with_status(ViolationStatus::Open))
            .await
            .unwrap();
        assert_eq!(open.len(), 2);
        let pair = open.iter().find(|v| v.rule_id == RuleId::new("wt")).unwrap();
        assert_eq!(pair.record_ids, vec!["r1".to_string(), "r2".to_string()]);
        assert_eq!(repository.runs().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_one_bad_rule_does_not_abort_the_run() {
        let repository = Arc::new(InMemoryViolationRepository::new());
        let engine = engine(repository.clone());
        let data = dataset("partial").await;
        let rules = vec![
            Rule::for_field("bad", "pulse", "> 0"),
            Rule::for_field("hr", "heart_rate", ">= 40"),
            Rule::for_field("months", "heart_rate", "add_months(2024-01-01, heart_rate) > 2024-01-01")
                .with_context(ExecutionContext::Batch),
        ];

        let report = engine.run_batch(&rules, &data).await.unwrap();
        assert_eq!(report.status, RunStatus::CompletedWithErrors);
        assert_eq!(report.failed_rules().count(), 2);
        assert!(matches!(
            report.entry(&RuleId::new("hr")).unwrap().outcome,
            RuleOutcome::Succeeded { rows_scanned: Some(2), created: 1, .. }
        ));
        let ids: Vec<&str> = report.entries.iter().map(|e| e.rule_id.as_str()).collect();
        assert_eq!(ids, vec!["bad", "hr", "months"]);
    }

    #[tokio::test]
    async fn test_realtime_only_and_retired_rules_are_not_run() {
        let repository = Arc::new(InMemoryViolationRepository::new());
        let engine = engine(repository.clone());
        let data = dataset("filtered").await;
        let rules = vec![
            Rule::for_field("rt", "heart_rate", ">= 40").with_context(ExecutionContext::RealTime),
            Rule::for_field("old", "heart_rate", ">= 40").retire(),
        ];
        let report = engine.run_batch(&rules, &data).await.unwrap();
        assert!(report.entries.is_empty());
        assert_eq!(repository.size().await, 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_skips_every_rule() {
        let repository = Arc::new(InMemoryViolationRepository::new());
        let engine = engine(repository.clone());
        let data = dataset("cancelled").await;
        let rules = vec![Rule::for_field("hr", "heart_rate", ">= 40")];
        let (cancel, cancelled) = watch::channel(false);
        cancel.send(true).unwrap();

        let report = engine
            .run_batch_with_cancel(&rules, &data, cancelled)
            .await
            .unwrap();
        assert_eq!(report.status, RunStatus::Cancelled);
        assert_eq!(report.entries[0].outcome, RuleOutcome::Skipped);
        assert_eq!(repository.size().await, 0);
        assert_eq!(repository.runs().await.unwrap()[0].status, RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_unreadable_row_count_still_records_the_run() {
        let repository = Arc::new(InMemoryViolationRepository::new());
        let engine = engine(repository.clone());
        let mut data = TrackedDataset::new(dataset("uncounted").await);
        data.row_count_fails = true;
        let rules = vec![Rule::for_field("hr", "heart_rate", ">= 40")];

        let report = engine.run_batch(&rules, &data).await.unwrap();
        assert_eq!(report.status, RunStatus::Completed);
        assert!(matches!(
            report.entries[0].outcome,
            RuleOutcome::Succeeded { rows_scanned: None, created: 1, .. }
        ));
        assert_eq!(repository.runs().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cancellation_mid_run_skips_remaining_rules() {
        let repository = Arc::new(InMemoryViolationRepository::new());
        let config = QcConfig::default().with_max_workers(1);
        let engine = QcEngine::new(schema(), repository.clone(), config)
            .with_locks(Arc::new(DatasetLocks::default()));
        let (cancel, cancelled) = watch::channel(false);
        let mut data = TrackedDataset::new(dataset("cancelled-mid-run").await);
        data.cancel_after_query = Some(cancel);
        let rules = vec![
            Rule::for_field("first", "heart_rate", ">= 40"),
            Rule::for_field("second", "heart_rate", "<= 200"),
            Rule::for_field("third", "weight", "> 0"),
        ];

        let report = engine
            .run_batch_with_cancel(&rules, &data, cancelled)
            .await
            .unwrap();
        assert_eq!(report.status, RunStatus::Cancelled);
        assert!(matches!(
            report.entries[0].outcome,
            RuleOutcome::Succeeded { created: 1, .. }
        ));
        assert_eq!(report.entries[1].outcome, RuleOutcome::Skipped);
        assert_eq!(report.entries[2].outcome, RuleOutcome::Skipped);
        assert_eq!(repository.size().await, 1);

        let runs = repository.runs().await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_rule_concurrency_is_bounded_by_workers() {
        let repository = Arc::new(InMemoryViolationRepository::new());
        let engine = engine(repository);
        let data = TrackedDataset::new(dataset("bounded").await);
        let rules: Vec<Rule> = (0..6)
            .map(|i| Rule::for_field(format!("hr{i}"), "heart_rate", ">= 40"))
            .collect();

        let report = engine.run_batch(&rules, &data).await.unwrap();
        assert_eq!(report.entries.len(), 6);
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(data.peak.load(Ordering::SeqCst), engine.config().workers());
    }

    #[tokio::test]
    async fn test_concurrent_run_on_same_dataset_is_refused() {
        let repository = Arc::new(InMemoryViolationRepository::new());
        let locks = Arc::new(DatasetLocks::default());
        let engine = engine(repository).with_locks(locks.clone());
        let data = dataset("locked").await;

        let _held = locks.try_acquire("locked").unwrap();
        let err = engine.run_batch(&[], &data).await.unwrap_err();
        assert!(matches!(err, QcError::RunInProgress { .. }));
    }
}
