//! Persisted QC findings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::rule::{RuleId, Severity};

/// Lifecycle state of a violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViolationStatus {
    Open,
    Resolved,
}

/// Who closed a violation, when, and why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub resolved_by: String,
    pub resolved_at: DateTime<Utc>,
    pub comment: Option<String>,
}

impl Resolution {
    pub fn new(resolved_by: impl Into<String>) -> Self {
        Self {
            resolved_by: resolved_by.into(),
            resolved_at: Utc::now(),
            comment: None,
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }
}

/// A batch rule failing for a specific record (or record pair).
///
/// At most one `Open` violation exists per rule and record key; repeated
/// detections only move `last_seen`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QcViolation {
    pub id: Uuid,
    pub rule_id: RuleId,
    /// Identifiers of the offending record(s). Cross-visit findings carry two.
    pub record_ids: Vec<String>,
    pub severity: Severity,
    pub status: ViolationStatus,
    pub detected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub resolution: Option<Resolution>,
}

impl QcViolation {
    /// Creates an open violation first seen at `at`.
    pub fn open(
        rule_id: RuleId,
        record_ids: Vec<String>,
        severity: Severity,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            rule_id,
            record_ids,
            severity,
            status: ViolationStatus::Open,
            detected_at: at,
            last_seen: at,
            resolution: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == ViolationStatus::Open
    }

    /// Records a repeated detection.
    pub fn touch(&mut self, at: DateTime<Utc>) {
        if at > self.last_seen {
            self.last_seen = at;
        }
    }

    /// Closes the violation.
    pub fn resolve(&mut self, resolution: Resolution) {
        self.status = ViolationStatus::Resolved;
        self.resolution = Some(resolution);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_touch_only_moves_forward() {
        let t0 = Utc::now();
        let mut v = QcViolation::open("r1".into(), vec!["rec-1".into()], Severity::Error, t0);
        v.touch(t0 + Duration::minutes(5));
        assert_eq!(v.last_seen, t0 + Duration::minutes(5));
        v.touch(t0);
        assert_eq!(v.last_seen, t0 + Duration::minutes(5));
        assert_eq!(v.detected_at, t0);
    }

    #[test]
    fn test_resolve() {
        let mut v = QcViolation::open("r1".into(), vec!["rec-1".into()], Severity::Info, Utc::now());
        assert!(v.is_open());
        v.resolve(Resolution::new("monitor").with_comment("source document checked"));
        assert_eq!(v.status, ViolationStatus::Resolved);
        assert_eq!(
            v.resolution.as_ref().and_then(|r| r.comment.as_deref()),
            Some("source document checked")
        );
    }
}
