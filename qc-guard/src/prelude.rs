//! Prelude for commonly used types and traits in qc-guard.

pub use crate::cache::{RefreshOutcome, RefreshReport, ValidatorCache};
pub use crate::compile::{compile_batch, compile_realtime, CompiledValidator, QueryFragment};
pub use crate::core::{
    ExecutionContext, FieldSchema, FieldType, QcConfig, QcViolation, Record, Resolution, Rule,
    RuleId, RuleScope, Severity, Value, ViolationStatus,
};
pub use crate::dsl::{parse_rule, Expr};
pub use crate::engine::{QcEngine, RunReport, RunStatus};
pub use crate::error::{CompileError, QcError, Result};
pub use crate::logging::LogConfig;
pub use crate::repository::{InMemoryViolationRepository, ViolationFilter, ViolationRepository};
pub use crate::sources::{Dataset, SessionDataset};
