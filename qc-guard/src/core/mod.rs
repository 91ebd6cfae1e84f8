//! Core data types shared by the compiler, the validator cache and the QC engine.
//!
//! - [`Value`] and [`Record`]: one submitted form record.
//! - [`FieldSchema`]: field names and types supplied by the host application.
//! - [`Rule`]: authored rule text plus scope, execution context and version.
//! - [`QcViolation`]: a persisted batch finding.
//! - [`QcConfig`]: engine configuration.

pub mod config;
pub mod record;
pub mod rule;
pub mod schema;
pub mod violation;

pub use config::{QcConfig, DEFAULT_MAX_RULE_LENGTH};
pub use record::{Record, Value, DATE_FORMAT};
pub use rule::{
    CrossVisitCheck, ExecutionContext, MissingDataCheck, OutlierCheck, Rule, RuleId, RuleKind,
    RuleScope, Severity,
};
pub use schema::{FieldSchema, FieldType};
pub use violation::{QcViolation, Resolution, ViolationStatus};
