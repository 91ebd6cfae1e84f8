//! Persistence of violations and run history.
//!
//! The host application supplies storage by implementing
//! [`ViolationRepository`]. The QC engine calls `upsert_detections` once per
//! rule from a single writer task, so an implementation only has to make each
//! call atomic.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::{QcViolation, Resolution, RuleId, Severity, ViolationStatus};
use crate::engine::RunReport;
use crate::error::Result;

pub mod in_memory;

pub use in_memory::InMemoryViolationRepository;

/// Counts returned by [`ViolationRepository::upsert_detections`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertSummary {
    pub created: usize,
    pub touched: usize,
}

/// Filter for [`ViolationRepository::find`].
///
/// ```rust
/// use qc_guard::core::ViolationStatus;
/// use qc_guard::repository::ViolationFilter;
///
/// let filter = ViolationFilter::all().for_rule("hr-range").with_status(ViolationStatus::Open);
/// assert!(filter.rule_id.is_some());
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViolationFilter {
    pub rule_id: Option<RuleId>,
    pub status: Option<ViolationStatus>,
}

impl ViolationFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_rule(mut self, rule_id: impl Into<RuleId>) -> Self {
        self.rule_id = Some(rule_id.into());
        self
    }

    pub fn with_status(mut self, status: ViolationStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn matches(&self, violation: &QcViolation) -> bool {
        self.rule_id.as_ref().is_none_or(|id| &violation.rule_id == id)
            && self.status.is_none_or(|s| violation.status == s)
    }
}

/// Storage for QC findings.
#[async_trait]
pub trait ViolationRepository: Send + Sync {
    /// Records one rule's detections as a single atomic step.
    ///
    /// Each detection is the record id list of one violating row. A detection
    /// matching an open violation of the same rule touches it; otherwise a new
    /// open violation is created.
    async fn upsert_detections(
        &self,
        rule_id: &RuleId,
        severity: Severity,
        detections: Vec<Vec<String>>,
        seen_at: DateTime<Utc>,
    ) -> Result<UpsertSummary>;

    /// Violations matching a filter, oldest first.
    async fn find(&self, filter: &ViolationFilter) -> Result<Vec<QcViolation>>;

    /// Closes an open violation.
    async fn resolve(&self, id: Uuid, resolution: Resolution) -> Result<QcViolation>;

    /// Appends a finished run to the history.
    async fn append_run(&self, report: RunReport) -> Result<()>;

    /// Run history, oldest first.
    async fn runs(&self) -> Result<Vec<RunReport>>;
}
