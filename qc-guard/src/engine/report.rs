//! Run history records.

use crate::compile::FragmentKind;
use crate::core::RuleId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Terminal state of a batch run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every rule ran.
    Completed,
    /// Every rule was attempted and at least one failed.
    CompletedWithErrors,
    /// Cancellation was observed; rules not yet started were skipped.
    Cancelled,
}

/// What happened to one rule within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum RuleOutcome {
    Succeeded {
        /// Rows in the dataset when the run started; `None` if the count
        /// could not be read
        rows_scanned: Option<usize>,
        /// Violating rows returned by the query
        detected: usize,
        /// New open violations
        created: usize,
        /// Already-open violations seen again
        touched: usize,
    },
    /// Compilation, query execution or persistence failed.
    Failed { error: String },
    /// Not started because the run was cancelled.
    Skipped,
}

/// Per-rule entry in a [`RunReport`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleRunEntry {
    pub rule_id: RuleId,
    pub rule_version: u32,
    pub kind: Option<FragmentKind>,
    pub outcome: RuleOutcome,
    pub duration_ms: u64,
}

impl RuleRunEntry {
    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, RuleOutcome::Failed { .. })
    }
}

/// The history record of one batch run.
///
/// Reports serialize to JSON for storage alongside violations:
///
/// ```rust
/// use qc_guard::engine::{RunReport, RunStatus};
///
/// let report = RunReport::begin("trial-7");
/// let report = report.finish(Vec::new(), false);
/// assert_eq!(report.status, RunStatus::Completed);
/// assert!(serde_json::to_string(&report).unwrap().contains("\"status\":\"completed\""));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub dataset: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub entries: Vec<RuleRunEntry>,
}

impl RunReport {
    /// Starts a report for a run beginning now.
    pub fn begin(dataset: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            dataset: dataset.into(),
            started_at: now,
            finished_at: now,
            status: RunStatus::Completed,
            entries: Vec::new(),
        }
    }

    /// Closes the report with its entries; the status follows from them.
    pub fn finish(mut self, entries: Vec<RuleRunEntry>, cancelled: bool) -> Self {
        self.status = if cancelled {
            RunStatus::Cancelled
        } else if entries.iter().any(RuleRunEntry::is_failure) {
            RunStatus::CompletedWithErrors
        } else {
            RunStatus::Completed
        };
        self.entries = entries;
        self.finished_at = Utc::now();
        self
    }

    pub fn entry(&self, rule_id: &RuleId) -> Option<&RuleRunEntry> {
        self.entries.iter().find(|e| &e.rule_id == rule_id)
    }

    pub fn failed_rules(&self) -> impl Iterator<Item = &RuleRunEntry> {
        self.entries.iter().filter(|e| e.is_failure())
    }

    /// New violations created by this run.
    pub fn created(&self) -> usize {
        self.entries
            .iter()
            .map(|e| match e.outcome {
                RuleOutcome::Succeeded { created, .. } => created,
                _ => 0,
            })
            .sum()
    }

    /// Open violations re-detected by this run.
    pub fn touched(&self) -> usize {
        self.entries
            .iter()
            .map(|e| match e.outcome {
                RuleOutcome::Succeeded { touched, .. } => touched,
                _ => 0,
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, outcome: RuleOutcome) -> RuleRunEntry {
        RuleRunEntry {
            rule_id: RuleId::new(id),
            rule_version: 1,
            kind: Some(FragmentKind::Expression),
            outcome,
            duration_ms: 3,
        }
    }

    #[test]
    fn test_status_follows_entries() {
        let ok = entry(
            "a",
            RuleOutcome::Succeeded {
                rows_scanned: Some(10),
                detected: 2,
                created: 1,
                touched: 1,
            },
        );
        let failed = entry(
            "b",
            RuleOutcome::Failed {
                error: "no such column".into(),
            },
        );

        let report = RunReport::begin("d").finish(vec![ok.clone()], false);
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.created(), 1);
        assert_eq!(report.touched(), 1);

        let report = RunReport::begin("d").finish(vec![ok.clone(), failed], false);
        assert_eq!(report.status, RunStatus::CompletedWithErrors);
        assert_eq!(report.failed_rules().count(), 1);

        let report = RunReport::begin("d").finish(vec![ok, entry("c", RuleOutcome::Skipped)], true);
        assert_eq!(report.status, RunStatus::Cancelled);
        assert!(report.finished_at >= report.started_at);
    }

    #[test]
    fn test_report_json_round_trip() {
        let report = RunReport::begin("d").finish(
            vec![entry(
                "b",
                RuleOutcome::Failed {
                    error: "boom".into(),
                },
            )],
            false,
        );
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["entries"][0]["outcome"]["outcome"], "failed");
        let back: RunReport = serde_json::from_value(json).unwrap();
        assert_eq!(back, report);
    }
}
