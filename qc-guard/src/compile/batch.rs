//! Batch generator: compiles an AST into a parameterized query that selects
//! the records violating the rule.
//!
//! Rule semantics carry over to SQL three-valued logic: a missing value is
//! `NULL`, the rule predicate is unknown exactly when the real-time validator
//! sees it as unknown, and violations are the rows where the predicate
//! `IS FALSE`. Every literal is a bound parameter wrapped in an explicit cast;
//! identifiers come only from the schema whitelist and are quoted.
//!
//! Datasets store dates as `Int64` day numbers (days since 1970-01-01),
//! numbers as `Float64`, text as `Utf8` and booleans as `Boolean`.

use super::realtime::shift_months;
use super::MAX_DAY_OFFSET;
use crate::core::{FieldSchema, FieldType, Value};
use crate::dsl::ast::{ArithOp, CompareOp, Expr, FieldRef, Function, Literal, Logical};
use crate::dsl::typing;
use crate::error::CompileError;
use crate::security::SqlSecurity;
use chrono::NaiveDate;
use datafusion::scalar::ScalarValue;
use serde::{Deserialize, Serialize};

/// Output column holding the violating record's identifier.
pub const RECORD_ID_COLUMN: &str = "qc_record_id";
/// Optional output column holding a second record involved in the violation.
pub const RELATED_ID_COLUMN: &str = "qc_related_id";

const TABLE_MARKER: &str = "{table}";

/// A parameter value, resolved when the query runs.
#[derive(Debug, Clone, PartialEq)]
pub enum BoundParam {
    Value(ScalarValue),
    /// The run's reference date as a day number.
    Today,
}

impl BoundParam {
    fn resolve(&self, today: NaiveDate) -> ScalarValue {
        match self {
            BoundParam::Value(value) => value.clone(),
            BoundParam::Today => ScalarValue::Int64(Some(Value::day_number(today))),
        }
    }
}

/// Which query shape produced a fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FragmentKind {
    Expression,
    CrossVisit,
    Outlier,
    MissingData,
}

/// A parameterized query selecting violating records.
///
/// `from` names the dataset table with a `{table}` marker that [`render`]
/// replaces with the quoted table name, so one fragment can run against any
/// registered table.
///
/// [`render`]: QueryFragment::render
#[derive(Debug, Clone, PartialEq)]
pub struct QueryFragment {
    pub kind: FragmentKind,
    pub select_list: String,
    pub from: String,
    pub where_clause: String,
    pub params: Vec<BoundParam>,
    pub explanation: String,
}

impl QueryFragment {
    /// Renders the full statement against a table.
    pub fn render(&self, table: &str) -> Result<String, CompileError> {
        let table = quote(table)?;
        Ok(format!(
            "SELECT {} FROM {} WHERE {}",
            self.select_list,
            self.from.replace(TABLE_MARKER, &table),
            self.where_clause
        ))
    }

    /// Parameter values in placeholder order, with `today` resolved.
    pub fn bind(&self, today: NaiveDate) -> Vec<ScalarValue> {
        self.params.iter().map(|p| p.resolve(today)).collect()
    }

    /// True when the fragment also reports a related record id.
    pub fn has_related_id(&self) -> bool {
        self.select_list.contains(RELATED_ID_COLUMN)
    }
}

/// Quotes a whitelisted identifier.
pub(crate) fn quote(identifier: &str) -> Result<String, CompileError> {
    SqlSecurity::escape_identifier(identifier).map_err(|e| CompileError::UnknownColumn {
        field: identifier.to_string(),
        reason: e.to_string(),
    })
}

/// A numeric expression as a whole number of days, truncated toward zero.
/// Counts beyond [`MAX_DAY_OFFSET`] are NULL rather than a cast error.
fn day_count(number: &str, unit: i64) -> String {
    let days = if unit == 1 {
        format!("CAST({number} AS BIGINT)")
    } else {
        format!("CAST({number} AS BIGINT) * {unit}")
    };
    format!("(CASE WHEN ABS(TRUNC({number}) * {unit}) <= {MAX_DAY_OFFSET} THEN {days} END)")
}

/// Collects bound parameters while SQL text is generated.
#[derive(Debug, Default)]
pub(crate) struct ParamList {
    params: Vec<BoundParam>,
}

impl ParamList {
    /// Binds a value and returns its placeholder, cast to `sql_type`.
    pub(crate) fn bind(&mut self, param: BoundParam, sql_type: &str) -> String {
        self.params.push(param);
        format!("CAST(${} AS {sql_type})", self.params.len())
    }

    pub(crate) fn bind_literal(&mut self, literal: &Literal) -> String {
        match literal {
            Literal::Number(n) => {
                self.bind(BoundParam::Value(ScalarValue::Float64(Some(*n))), "DOUBLE")
            }
            Literal::Text(s) => self.bind(
                BoundParam::Value(ScalarValue::Utf8(Some(s.clone()))),
                "VARCHAR",
            ),
            Literal::Date(d) => self.bind(
                BoundParam::Value(ScalarValue::Int64(Some(Value::day_number(*d)))),
                "BIGINT",
            ),
            Literal::Bool(b) => self.bind(BoundParam::Value(ScalarValue::Boolean(Some(*b))), "BOOLEAN"),
        }
    }

    pub(crate) fn into_inner(self) -> Vec<BoundParam> {
        self.params
    }
}

/// Compiles a parsed rule into a query over `{table}` selecting violations.
///
/// # Examples
///
/// ```rust
/// use qc_guard::compile::compile_batch;
/// use qc_guard::core::{FieldSchema, FieldType};
/// use qc_guard::dsl::parse_rule;
///
/// let schema = FieldSchema::new().field("heart_rate", FieldType::Number);
/// let expr = parse_rule("between 40 and 200", &schema, Some("heart_rate")).unwrap();
/// let fragment = compile_batch(&expr, &schema).unwrap();
///
/// let sql = fragment.render("visits").unwrap();
/// assert!(sql.starts_with("SELECT CAST(\"record_id\" AS VARCHAR) AS qc_record_id FROM \"visits\""));
/// assert!(sql.contains("IS FALSE"));
/// assert_eq!(fragment.params.len(), 2);
/// ```
pub fn compile_batch(expr: &Expr, schema: &FieldSchema) -> Result<QueryFragment, CompileError> {
    let mut generator = SqlGenerator {
        schema,
        params: ParamList::default(),
    };
    let predicate = generator.predicate(expr)?;
    let record_key = quote(schema.record_key())?;
    Ok(QueryFragment {
        kind: FragmentKind::Expression,
        select_list: format!("CAST({record_key} AS VARCHAR) AS {RECORD_ID_COLUMN}"),
        from: TABLE_MARKER.to_string(),
        where_clause: format!("({predicate}) IS FALSE"),
        params: generator.params.into_inner(),
        explanation: format!("Records for which `{expr}` is false"),
    })
}

struct SqlGenerator<'a> {
    schema: &'a FieldSchema,
    params: ParamList,
}

impl SqlGenerator<'_> {
    fn predicate(&mut self, expr: &Expr) -> Result<String, CompileError> {
        let sql = match expr {
            Expr::Literal(literal) => self.params.bind_literal(literal),
            Expr::FieldRef(field) => self.column(field)?,
            Expr::Comparison { op, left, right } => {
                let left = self.predicate(left)?;
                let right = self.predicate(right)?;
                format!("({left} {} {right})", sql_operator(*op))
            }
            Expr::Range { value, low, high } => {
                let value = self.predicate(value)?;
                let low = self.predicate(low)?;
                let high = self.predicate(high)?;
                // A plain AND would be definitely false for `5 between NULL and 3`.
                format!(
                    "(CASE WHEN {value} IS NULL OR {low} IS NULL OR {high} IS NULL \
                     THEN CAST(NULL AS BOOLEAN) ELSE ({value} >= {low} AND {value} <= {high}) END)"
                )
            }
            Expr::InList { value, items } => {
                let value = self.predicate(value)?;
                format!("({value} IN ({}))", self.list(items))
            }
            Expr::NotInList { value, items } => {
                let value = self.predicate(value)?;
                format!("({value} NOT IN ({}))", self.list(items))
            }
            Expr::Logical(Logical::And(children)) => self.conjunction(children)?,
            Expr::Logical(Logical::Or(children)) => {
                let parts = children
                    .iter()
                    .map(|c| self.predicate(c))
                    .collect::<Result<Vec<_>, _>>()?;
                format!("({})", parts.join(" OR "))
            }
            Expr::Logical(Logical::Not(child)) => format!("(NOT {})", self.predicate(child)?),
            Expr::Conditional {
                condition,
                then_branch,
                else_branch,
            } => {
                let condition = self.predicate(condition)?;
                let then_branch = self.conjunction(then_branch)?;
                let else_branch = self.conjunction(else_branch)?;
                format!("(CASE WHEN {condition} THEN {then_branch} ELSE {else_branch} END)")
            }
            Expr::Required { field, unless } => {
                let column = self.column(field)?;
                match unless {
                    Some(guard) => {
                        let guard = self.predicate(guard)?;
                        format!("({column} IS NOT NULL OR COALESCE({guard}, FALSE))")
                    }
                    None => format!("({column} IS NOT NULL)"),
                }
            }
            Expr::FunctionCall { function, args } => self.call(*function, args)?,
            Expr::Arithmetic { op, left, right } => {
                let left_type = typing::type_of(left);
                let right_type = typing::type_of(right);
                let l = self.predicate(left)?;
                let r = self.predicate(right)?;
                match (op, left_type, right_type) {
                    (ArithOp::Sub, FieldType::Date, FieldType::Date) => {
                        format!("CAST(({l} - {r}) AS DOUBLE)")
                    }
                    (_, FieldType::Date, _) => {
                        format!("({l} {} {})", op.as_str(), day_count(&r, 1))
                    }
                    (_, _, FieldType::Date) => format!("({} + {r})", day_count(&l, 1)),
                    _ => format!("({l} {} {r})", op.as_str()),
                }
            }
        };
        Ok(sql)
    }

    /// AND of a node list; an empty list holds.
    fn conjunction(&mut self, exprs: &[Expr]) -> Result<String, CompileError> {
        if exprs.is_empty() {
            return Ok("TRUE".to_string());
        }
        let parts = exprs
            .iter()
            .map(|e| self.predicate(e))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(format!("({})", parts.join(" AND ")))
    }

    fn list(&mut self, items: &[Literal]) -> String {
        items
            .iter()
            .map(|item| self.params.bind_literal(item))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// A whitelisted, quoted column. Blank text reads as NULL, as it does for
    /// real-time records.
    fn column(&self, field: &FieldRef) -> Result<String, CompileError> {
        match self.schema.field_type(&field.name) {
            Some(ty) if ty == field.ty => {}
            Some(ty) => {
                return Err(CompileError::UnknownColumn {
                    field: field.name.clone(),
                    reason: format!("declared as {ty}, rule expects {}", field.ty),
                })
            }
            None => {
                return Err(CompileError::UnknownColumn {
                    field: field.name.clone(),
                    reason: "not in the field schema".to_string(),
                })
            }
        }
        let column = quote(&field.name)?;
        Ok(match field.ty {
            FieldType::Text => {
                format!("(CASE WHEN TRIM({column}) = '' THEN NULL ELSE {column} END)")
            }
            FieldType::Number | FieldType::Date | FieldType::Boolean => column,
        })
    }

    fn call(&mut self, function: Function, args: &[Expr]) -> Result<String, CompileError> {
        if function == Function::AddMonths {
            return self.fold_add_months(args);
        }
        let args = args
            .iter()
            .map(|a| self.predicate(a))
            .collect::<Result<Vec<_>, _>>()?;
        let sql = match (function, args.as_slice()) {
            (Function::Today, []) => self.params.bind(BoundParam::Today, "BIGINT"),
            (Function::Length, [text]) => format!("CAST(character_length({text}) AS DOUBLE)"),
            (Function::DaysBetween, [a, b]) => format!("CAST(({b} - {a}) AS DOUBLE)"),
            (Function::AddDays, [d, n]) => format!("({d} + {})", day_count(n, 1)),
            (Function::AddWeeks, [d, n]) => format!("({d} + {})", day_count(n, 7)),
            (Function::Within, [a, b, n]) => format!("(ABS({a} - {b}) <= {n})"),
            (function, args) => {
                return Err(CompileError::unsupported(
                    "batch",
                    format!("{} with {} argument(s)", function.name(), args.len()),
                ))
            }
        };
        Ok(sql)
    }
}

impl SqlGenerator<'_> {
    /// Month arithmetic only over literals, computed here and bound as a date.
    fn fold_add_months(&mut self, args: &[Expr]) -> Result<String, CompileError> {
        let folded = match args {
            [Expr::Literal(Literal::Date(date)), Expr::Literal(Literal::Number(months))] => {
                shift_months(*date, *months).ok()
            }
            _ => None,
        };
        match folded {
            Some(Value::Date(date)) => Ok(self.params.bind_literal(&Literal::Date(date))),
            _ => Err(CompileError::unsupported(
                "batch",
                "add_months over a column: calendar months cannot be computed over day-number columns",
            )),
        }
    }
}

fn sql_operator(op: CompareOp) -> &'static str {
    match op {
        CompareOp::Lt => "<",
        CompareOp::Le => "<=",
        CompareOp::Gt => ">",
        CompareOp::Ge => ">=",
        CompareOp::Eq => "=",
        CompareOp::Ne => "<>",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsl::parse_rule;

    fn schema() -> FieldSchema {
        FieldSchema::new()
            .field("heart_rate", FieldType::Number)
            .field("medication", FieldType::Text)
            .field("dose", FieldType::Number)
            .field("visit_date", FieldType::Date)
            .field("baseline_date", FieldType::Date)
    }

    fn fragment(source: &str, subject: Option<&str>) -> QueryFragment {
        let schema = schema();
        let expr = parse_rule(source, &schema, subject).unwrap();
        compile_batch(&expr, &schema).unwrap()
    }

    #[test]
    fn test_literals_are_bound() {
        let f = fragment("medication == \"x'); DROP TABLE data; --\"", None);
        let sql = f.render("data").unwrap();
        assert!(!sql.contains("DROP"));
        assert_eq!(
            f.params,
            vec![BoundParam::Value(ScalarValue::Utf8(Some(
                "x'); DROP TABLE data; --".to_string()
            )))]
        );
    }

    #[test]
    fn test_range_sql_shape() {
        let f = fragment("between 40 and 200", Some("heart_rate"));
        assert_eq!(
            f.where_clause,
            "((CASE WHEN \"heart_rate\" IS NULL OR CAST($1 AS DOUBLE) IS NULL OR CAST($2 AS DOUBLE) IS NULL \
             THEN CAST(NULL AS BOOLEAN) ELSE (\"heart_rate\" >= CAST($1 AS DOUBLE) AND \"heart_rate\" <= CAST($2 AS DOUBLE)) END)) IS FALSE"
        );
        assert_eq!(f.kind, FragmentKind::Expression);
        assert!(f.explanation.contains("heart_rate between 40 and 200"));
    }

    #[test]
    fn test_conditional_and_required() {
        let f = fragment(r#"if medication == "yes" then dose required endif"#, None);
        assert!(f.where_clause.contains("CASE WHEN"));
        assert!(f.where_clause.contains("(\"dose\" IS NOT NULL)"));
        assert!(f.where_clause.contains("ELSE TRUE END"));
    }

    #[test]
    fn test_today_is_resolved_at_bind_time() {
        let f = fragment("visit_date <= today", None);
        assert_eq!(f.params, vec![BoundParam::Today]);
        let today = NaiveDate::from_ymd_opt(1970, 1, 31).unwrap();
        assert_eq!(f.bind(today), vec![ScalarValue::Int64(Some(30))]);
    }

    #[test]
    fn test_date_literals_bind_as_day_numbers() {
        let f = fragment("visit_date > 1970-01-02", None);
        assert_eq!(f.bind(NaiveDate::default()), vec![ScalarValue::Int64(Some(1))]);
        assert!(f.where_clause.contains("CAST($1 AS BIGINT)"));
    }

    #[test]
    fn test_day_offsets_are_range_guarded() {
        let f = fragment("visit_date + dose > baseline_date", None);
        assert!(f.where_clause.contains(&format!(
            "(CASE WHEN ABS(TRUNC(\"dose\") * 1) <= {MAX_DAY_OFFSET} THEN CAST(\"dose\" AS BIGINT) END)"
        )));

        let f = fragment("add_weeks(visit_date, dose) > baseline_date", None);
        assert!(f.where_clause.contains("CAST(\"dose\" AS BIGINT) * 7 END"));
    }

    #[test]
    fn test_add_months_is_unsupported() {
        let schema = schema();
        let expr = parse_rule("add_months(baseline_date, 6) > visit_date", &schema, None).unwrap();
        assert!(matches!(
            compile_batch(&expr, &schema),
            Err(CompileError::Unsupported { target: "batch", .. })
        ));
    }

    #[test]
    fn test_add_months_over_literals_is_folded() {
        let f = fragment("visit_date < add_months(2024-01-31, 1)", None);
        let expected = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
        assert_eq!(
            f.bind(NaiveDate::default()),
            vec![ScalarValue::Int64(Some(Value::day_number(expected)))]
        );
    }

    #[test]
    fn test_dropped_field_is_rejected() {
        let expr = parse_rule("heart_rate > 1", &schema(), None).unwrap();
        let narrower = FieldSchema::new().field("dose", FieldType::Number);
        assert!(matches!(
            compile_batch(&expr, &narrower),
            Err(CompileError::UnknownColumn { .. })
        ));
    }

    #[test]
    fn test_unsafe_table_name_is_rejected() {
        let f = fragment("dose > 1", None);
        assert!(f.render("data; DROP TABLE x").is_err());
        assert!(!f.has_related_id());
    }
}
