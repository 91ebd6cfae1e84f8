//! Code generators for the two execution targets.
//!
//! Both generators consume the same [`Expr`](crate::dsl::Expr) and must agree
//! on which records violate a rule. Each matches every AST variant without a
//! wildcard arm, so adding a node kind fails to build until both handle it.
//!
//! - [`realtime`]: closures over a single [`Record`](crate::core::Record).
//! - [`batch`]: parameterized SQL selecting violating rows.
//! - [`templates`]: cross-visit, outlier and missing-data queries.

pub mod batch;
pub mod realtime;
pub mod templates;

pub use batch::{
    compile_batch, BoundParam, FragmentKind, QueryFragment, RECORD_ID_COLUMN, RELATED_ID_COLUMN,
};
pub use realtime::{compile_realtime, compile_rule, CompiledValidator, ValidationOutcome};

use crate::core::{FieldSchema, Rule, RuleKind};
use crate::error::CompileError;
use crate::logging::{truncate_field, LogConfig};
use tracing::{debug, instrument};

/// Largest day offset date arithmetic accepts, about 100 000 years. A larger
/// offset is unknown in both targets.
pub const MAX_DAY_OFFSET: i64 = 36_500_000;

/// Compiles any rule kind into a batch query.
#[instrument(skip(rule, schema, log), fields(rule.id = %rule.id, rule.version = rule.version))]
pub fn compile_batch_rule(
    rule: &Rule,
    schema: &FieldSchema,
    max_rule_length: usize,
    log: &LogConfig,
) -> Result<QueryFragment, CompileError> {
    if log.log_rule_source {
        debug!(
            rule.source = %truncate_field(&rule.source, log.max_field_length),
            "Compiling batch rule"
        );
    }
    let fragment = match &rule.kind {
        RuleKind::Expression => {
            let expr = rule.ast_with_limit(schema, max_rule_length)?;
            compile_batch(&expr, schema)?
        }
        RuleKind::CrossVisit(check) => templates::cross_visit(check, schema)?,
        RuleKind::Outlier(check) => templates::outlier(check, schema)?,
        RuleKind::MissingData(check) => templates::missing_data(check, schema)?,
    };
    debug!(
        kind = ?fragment.kind,
        params = fragment.params.len(),
        "Batch rule compiled"
    );
    Ok(fragment)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::FieldType;

    #[test]
    fn test_dispatch_by_kind() {
        let schema = FieldSchema::new()
            .field("weight", FieldType::Number)
            .field("visit_date", FieldType::Date);
        let log = LogConfig::verbose();

        let expr = Rule::for_field("w", "weight", "> 0");
        let cross = Rule::cross_visit("cv", "weight", 2.5);
        let outlier = Rule::outlier("o", "weight", 3.0, None);
        let missing = Rule::missing_data("m", ["V1", "V2"]);

        let kinds: Vec<FragmentKind> = [expr, cross, outlier, missing]
            .iter()
            .map(|r| compile_batch_rule(r, &schema, 4096, &log).unwrap().kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                FragmentKind::Expression,
                FragmentKind::CrossVisit,
                FragmentKind::Outlier,
                FragmentKind::MissingData
            ]
        );
    }

    #[test]
    fn test_front_end_errors_pass_through() {
        let schema = FieldSchema::new().field("weight", FieldType::Number);
        let rule = Rule::for_field("w", "weight", "between 1 and");
        let err = compile_batch_rule(&rule, &schema, 4096, &LogConfig::default()).unwrap_err();
        assert!(err.is_front_end());

        let long = Rule::for_field("w", "weight", format!("> {}", "1".repeat(64)));
        let err = compile_batch_rule(&long, &schema, 16, &LogConfig::default()).unwrap_err();
        assert!(matches!(err, CompileError::Lex(_)));
    }
}
