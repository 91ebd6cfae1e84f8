//! Real-time generator: compiles an AST into a predicate over one record.
//!
//! The predicate is a tree of closures mirroring the AST. Rule text is never
//! evaluated directly; each node kind maps to one fixed closure shape.
//!
//! Evaluation uses three-valued logic. A comparison with a missing operand is
//! unknown, a rule fails only when it is definitely false, and `required` is
//! the only node that turns absence into failure. Values that cannot be
//! coerced to their field's type make the rule fail with a diagnostic.

use super::MAX_DAY_OFFSET;
use crate::core::{FieldSchema, Record, Rule, RuleId, Value};
use crate::dsl::ast::{ArithOp, CompareOp, Expr, FieldRef, Function, Literal, Logical};
use crate::error::CompileError;
use chrono::{Months, NaiveDate, TimeDelta, Utc};
use std::fmt;
use std::sync::Arc;

/// What a node produced for one record.
#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Present(Value),
    Missing,
    /// The record held a value of the wrong type.
    Invalid(String),
}

/// Evaluation inputs besides the AST.
struct Scope<'r> {
    record: &'r Record,
    today: NaiveDate,
}

type Node = Box<dyn Fn(&Scope<'_>) -> Operand + Send + Sync>;

/// Result of evaluating a validator against a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationOutcome {
    pub passed: bool,
    pub message: Option<String>,
}

impl ValidationOutcome {
    fn pass() -> Self {
        Self {
            passed: true,
            message: None,
        }
    }
}

struct Check {
    rule_id: Option<RuleId>,
    field: Option<String>,
    source: String,
    template: Option<String>,
    predicate: Arc<dyn Fn(&Scope<'_>) -> Operand + Send + Sync>,
}

impl Clone for Check {
    fn clone(&self) -> Self {
        Self {
            rule_id: self.rule_id.clone(),
            field: self.field.clone(),
            source: self.source.clone(),
            template: self.template.clone(),
            predicate: Arc::clone(&self.predicate),
        }
    }
}

impl Check {
    fn message(&self, record: &Record) -> String {
        let field = self
            .field
            .as_deref()
            .or(self.rule_id.as_ref().map(RuleId::as_str))
            .unwrap_or("record");
        let value = self
            .field
            .as_deref()
            .and_then(|f| record.get(f))
            .map_or_else(|| "missing".to_string(), Value::to_string);
        let template = self
            .template
            .as_deref()
            .unwrap_or("{field} fails rule '{rule}' (value: {value})");
        template
            .replace("{field}", field)
            .replace("{value}", &value)
            .replace("{rule}", &self.source)
    }
}

/// A compiled real-time predicate plus its failure-message template.
///
/// Validators are immutable. Several validators for the same field can be
/// merged with [`CompiledValidator::combine`]; the merged validator reports
/// every failing rule.
///
/// # Examples
///
/// ```rust
/// use qc_guard::compile::compile_realtime;
/// use qc_guard::core::{FieldSchema, FieldType, Record};
/// use qc_guard::dsl::parse_rule;
///
/// let schema = FieldSchema::new().field("heart_rate", FieldType::Number);
/// let expr = parse_rule("between 40 and 200", &schema, Some("heart_rate")).unwrap();
/// let validator = compile_realtime(&expr, &schema).unwrap();
///
/// assert!(!validator.evaluate(&Record::new().with("heart_rate", 39)).passed);
/// assert!(validator.evaluate(&Record::new().with("heart_rate", 40)).passed);
/// // missing is not a violation
/// assert!(validator.evaluate(&Record::new()).passed);
/// ```
#[derive(Clone)]
pub struct CompiledValidator {
    checks: Vec<Check>,
}

impl fmt::Debug for CompiledValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledValidator")
            .field("rules", &self.rule_ids().collect::<Vec<_>>())
            .field("checks", &self.checks.len())
            .finish()
    }
}

impl CompiledValidator {
    /// Attaches rule metadata used in failure messages.
    pub fn for_rule(mut self, rule: &Rule) -> Self {
        for check in &mut self.checks {
            check.rule_id = Some(rule.id.clone());
            check.field = rule.target_field().map(str::to_string);
            check.source = rule.source.clone();
            check.template = rule.message.clone();
        }
        self
    }

    /// Merges validators; the result fails if any part fails.
    pub fn combine<'a, I>(validators: I) -> Self
    where
        I: IntoIterator<Item = &'a CompiledValidator>,
    {
        Self {
            checks: validators
                .into_iter()
                .flat_map(|v| v.checks.iter().cloned())
                .collect(),
        }
    }

    /// Ids of the rules this validator checks.
    pub fn rule_ids(&self) -> impl Iterator<Item = &RuleId> {
        self.checks.iter().filter_map(|c| c.rule_id.as_ref())
    }

    /// Evaluates against a record with `today` resolved to the current UTC date.
    pub fn evaluate(&self, record: &Record) -> ValidationOutcome {
        self.evaluate_at(record, Utc::now().date_naive())
    }

    /// Evaluates against a record with an explicit `today`.
    pub fn evaluate_at(&self, record: &Record, today: NaiveDate) -> ValidationOutcome {
        let scope = Scope { record, today };
        let failures: Vec<String> = self
            .checks
            .iter()
            .filter_map(|check| match (check.predicate)(&scope) {
                Operand::Present(Value::Bool(false)) => Some(check.message(record)),
                Operand::Invalid(diagnostic) => {
                    Some(format!("{} ({diagnostic})", check.message(record)))
                }
                Operand::Present(_) | Operand::Missing => None,
            })
            .collect();
        if failures.is_empty() {
            ValidationOutcome::pass()
        } else {
            ValidationOutcome {
                passed: false,
                message: Some(failures.join("; ")),
            }
        }
    }
}

/// Compiles a parsed rule into a real-time validator.
///
/// Field references are re-checked against `schema`, so an AST parsed against
/// an older schema cannot read a field that has since been dropped or retyped.
pub fn compile_realtime(
    expr: &Expr,
    schema: &FieldSchema,
) -> Result<CompiledValidator, CompileError> {
    let predicate: Arc<dyn Fn(&Scope<'_>) -> Operand + Send + Sync> =
        Arc::from(compile_node(expr, schema)?);
    Ok(CompiledValidator {
        checks: vec![Check {
            rule_id: None,
            field: None,
            source: String::new(),
            template: None,
            predicate,
        }],
    })
}

/// Parses and compiles a rule, attaching its metadata.
pub fn compile_rule(
    rule: &Rule,
    schema: &FieldSchema,
    max_rule_length: usize,
) -> Result<CompiledValidator, CompileError> {
    let expr = rule.ast_with_limit(schema, max_rule_length)?;
    Ok(compile_realtime(&expr, schema)?.for_rule(rule))
}

fn compile_node(expr: &Expr, schema: &FieldSchema) -> Result<Node, CompileError> {
    let node: Node = match expr {
        Expr::Literal(literal) => {
            let value = literal.to_value();
            Box::new(move |_: &Scope<'_>| Operand::Present(value.clone()))
        }
        Expr::FieldRef(field) => field_node(field, schema)?,
        Expr::Comparison { op, left, right } => {
            let op = *op;
            let left = compile_node(left, schema)?;
            let right = compile_node(right, schema)?;
            Box::new(move |scope: &Scope<'_>| {
                operands(&[&left, &right], scope, |values| {
                    compare(&values[0], &values[1], op).map(Value::Bool)
                })
            })
        }
        Expr::Range { value, low, high } => {
            let value = compile_node(value, schema)?;
            let low = compile_node(low, schema)?;
            let high = compile_node(high, schema)?;
            Box::new(move |scope: &Scope<'_>| {
                operands(&[&value, &low, &high], scope, |v| {
                    let above = compare(&v[0], &v[1], CompareOp::Ge)?;
                    let below = compare(&v[0], &v[2], CompareOp::Le)?;
                    Ok(Value::Bool(above && below))
                })
            })
        }
        Expr::InList { value, items } => membership(value, items, schema, false)?,
        Expr::NotInList { value, items } => membership(value, items, schema, true)?,
        Expr::Logical(Logical::And(children)) => {
            let children = compile_all(children, schema)?;
            Box::new(move |scope: &Scope<'_>| all(&children, scope))
        }
        Expr::Logical(Logical::Or(children)) => {
            let children = compile_all(children, schema)?;
            Box::new(move |scope: &Scope<'_>| any(&children, scope))
        }
        Expr::Logical(Logical::Not(child)) => {
            let child = compile_node(child, schema)?;
            Box::new(move |scope: &Scope<'_>| match child(scope) {
                Operand::Present(Value::Bool(b)) => Operand::Present(Value::Bool(!b)),
                other => other,
            })
        }
        Expr::Conditional {
            condition,
            then_branch,
            else_branch,
        } => {
            let condition = compile_node(condition, schema)?;
            let then_branch = compile_all(then_branch, schema)?;
            let else_branch = compile_all(else_branch, schema)?;
            Box::new(move |scope: &Scope<'_>| match condition(scope) {
                Operand::Present(Value::Bool(true)) => all(&then_branch, scope),
                Operand::Invalid(diagnostic) => Operand::Invalid(diagnostic),
                _ => all(&else_branch, scope),
            })
        }
        Expr::Required { field, unless } => {
            check_field(field, schema)?;
            let name = field.name.clone();
            let unless = unless
                .as_deref()
                .map(|guard| compile_node(guard, schema))
                .transpose()?;
            Box::new(move |scope: &Scope<'_>| {
                let present = scope.record.get(&name).is_some_and(|v| !v.is_missing());
                let excused = || {
                    unless.as_ref().is_some_and(|guard| {
                        guard(scope) == Operand::Present(Value::Bool(true))
                    })
                };
                Operand::Present(Value::Bool(present || excused()))
            })
        }
        Expr::FunctionCall { function, args } => {
            let function = *function;
            let args = compile_all(args, schema)?;
            Box::new(move |scope: &Scope<'_>| {
                if function == Function::Today {
                    return Operand::Present(Value::Date(scope.today));
                }
                let refs: Vec<&Node> = args.iter().collect();
                operands(&refs, scope, |values| call(function, values))
            })
        }
        Expr::Arithmetic { op, left, right } => {
            let op = *op;
            let left = compile_node(left, schema)?;
            let right = compile_node(right, schema)?;
            Box::new(move |scope: &Scope<'_>| {
                operands(&[&left, &right], scope, |v| arithmetic(op, &v[0], &v[1]))
            })
        }
    };
    Ok(node)
}

fn compile_all(exprs: &[Expr], schema: &FieldSchema) -> Result<Vec<Node>, CompileError> {
    exprs.iter().map(|e| compile_node(e, schema)).collect()
}

fn check_field(field: &FieldRef, schema: &FieldSchema) -> Result<(), CompileError> {
    match schema.field_type(&field.name) {
        Some(ty) if ty == field.ty => Ok(()),
        Some(ty) => Err(CompileError::UnknownColumn {
            field: field.name.clone(),
            reason: format!("declared as {ty}, rule expects {}", field.ty),
        }),
        None => Err(CompileError::UnknownColumn {
            field: field.name.clone(),
            reason: "not in the field schema".to_string(),
        }),
    }
}

fn field_node(field: &FieldRef, schema: &FieldSchema) -> Result<Node, CompileError> {
    check_field(field, schema)?;
    let name = field.name.clone();
    let ty = field.ty;
    Ok(Box::new(move |scope: &Scope<'_>| match scope.record.get(&name) {
        Some(raw) if !raw.is_missing() => match ty.coerce(raw) {
            Ok(value) => Operand::Present(value),
            Err(diagnostic) => Operand::Invalid(format!("{name}: {diagnostic}")),
        },
        _ => Operand::Missing,
    }))
}

fn membership(
    value: &Expr,
    items: &[Literal],
    schema: &FieldSchema,
    negated: bool,
) -> Result<Node, CompileError> {
    let value = compile_node(value, schema)?;
    let items: Vec<Value> = items.iter().map(Literal::to_value).collect();
    Ok(Box::new(move |scope: &Scope<'_>| {
        operands(&[&value], scope, |v| {
            let mut found = false;
            for item in &items {
                found |= compare(&v[0], item, CompareOp::Eq)?;
            }
            Ok(Value::Bool(found != negated))
        })
    }))
}

/// Evaluates operands left to right. Invalid wins over missing, and the
/// combining function only sees present values. A null result is missing.
fn operands(
    nodes: &[&Node],
    scope: &Scope<'_>,
    combine: impl FnOnce(&[Value]) -> Result<Value, String>,
) -> Operand {
    let mut values = Vec::with_capacity(nodes.len());
    let mut missing = false;
    for node in nodes {
        match node(scope) {
            Operand::Present(value) => values.push(value),
            Operand::Missing => missing = true,
            Operand::Invalid(diagnostic) => return Operand::Invalid(diagnostic),
        }
    }
    if missing {
        return Operand::Missing;
    }
    match combine(&values) {
        Ok(Value::Null) => Operand::Missing,
        Ok(value) => Operand::Present(value),
        Err(diagnostic) => Operand::Invalid(diagnostic),
    }
}

/// Kleene conjunction; an empty list holds.
fn all(children: &[Node], scope: &Scope<'_>) -> Operand {
    let mut unknown = false;
    for child in children {
        match child(scope) {
            Operand::Present(Value::Bool(true)) => {}
            Operand::Present(Value::Bool(false)) => return Operand::Present(Value::Bool(false)),
            Operand::Invalid(diagnostic) => return Operand::Invalid(diagnostic),
            Operand::Present(_) | Operand::Missing => unknown = true,
        }
    }
    if unknown {
        Operand::Missing
    } else {
        Operand::Present(Value::Bool(true))
    }
}

/// Kleene disjunction.
fn any(children: &[Node], scope: &Scope<'_>) -> Operand {
    let mut unknown = false;
    for child in children {
        match child(scope) {
            Operand::Present(Value::Bool(true)) => return Operand::Present(Value::Bool(true)),
            Operand::Present(Value::Bool(false)) => {}
            Operand::Invalid(diagnostic) => return Operand::Invalid(diagnostic),
            Operand::Present(_) | Operand::Missing => unknown = true,
        }
    }
    if unknown {
        Operand::Missing
    } else {
        Operand::Present(Value::Bool(false))
    }
}

fn compare(left: &Value, right: &Value, op: CompareOp) -> Result<bool, String> {
    let ordering = match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.partial_cmp(b),
        (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
        (Value::Date(a), Value::Date(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    };
    ordering.map(|o| op.apply(o)).ok_or_else(|| {
        format!(
            "cannot compare {} with {}",
            left.type_name(),
            right.type_name()
        )
    })
}

/// Day offsets truncate toward zero, matching a SQL cast to an integer.
/// Offsets beyond [`MAX_DAY_OFFSET`] have no value.
fn day_offset(days: f64) -> Option<TimeDelta> {
    let days = days.trunc();
    if days.is_nan() || days.abs() > MAX_DAY_OFFSET as f64 {
        return None;
    }
    TimeDelta::try_days(days as i64)
}

fn shift_days(date: NaiveDate, days: f64, sign: i64) -> Result<Value, String> {
    let Some(delta) = day_offset(days) else {
        return Ok(Value::Null);
    };
    let shifted = if sign >= 0 {
        date.checked_add_signed(delta)
    } else {
        date.checked_sub_signed(delta)
    };
    shifted
        .map(Value::Date)
        .ok_or_else(|| "date arithmetic overflowed".to_string())
}

pub(crate) fn shift_months(date: NaiveDate, months: f64) -> Result<Value, String> {
    let months = months.trunc();
    let magnitude = Months::new(months.abs().min(f64::from(u32::MAX)) as u32);
    let shifted = if months >= 0.0 {
        date.checked_add_months(magnitude)
    } else {
        date.checked_sub_months(magnitude)
    };
    shifted
        .map(Value::Date)
        .ok_or_else(|| "date arithmetic overflowed".to_string())
}

fn type_error(function: &str, values: &[Value]) -> String {
    let types: Vec<&str> = values.iter().map(Value::type_name).collect();
    format!("{function} cannot take ({})", types.join(", "))
}

fn call(function: Function, values: &[Value]) -> Result<Value, String> {
    match (function, values) {
        (Function::Today, _) => Err("today takes no arguments".to_string()),
        (Function::Length, [Value::Text(s)]) => Ok(Value::Number(s.chars().count() as f64)),
        (Function::DaysBetween, [Value::Date(a), Value::Date(b)]) => {
            Ok(Value::Number((*b - *a).num_days() as f64))
        }
        (Function::AddDays, [Value::Date(d), Value::Number(n)]) => shift_days(*d, *n, 1),
        (Function::AddWeeks, [Value::Date(d), Value::Number(n)]) => {
            shift_days(*d, n.trunc() * 7.0, 1)
        }
        (Function::AddMonths, [Value::Date(d), Value::Number(n)]) => shift_months(*d, *n),
        (Function::Within, [Value::Date(a), Value::Date(b), Value::Number(n)]) => {
            Ok(Value::Bool(((*a - *b).num_days().abs() as f64) <= *n))
        }
        (function, values) => Err(type_error(function.name(), values)),
    }
}

fn arithmetic(op: ArithOp, left: &Value, right: &Value) -> Result<Value, String> {
    match (op, left, right) {
        (ArithOp::Add, Value::Number(a), Value::Number(b)) => Ok(Value::Number(a + b)),
        (ArithOp::Sub, Value::Number(a), Value::Number(b)) => Ok(Value::Number(a - b)),
        (ArithOp::Add, Value::Date(d), Value::Number(n))
        | (ArithOp::Add, Value::Number(n), Value::Date(d)) => shift_days(*d, *n, 1),
        (ArithOp::Sub, Value::Date(d), Value::Number(n)) => shift_days(*d, *n, -1),
        (ArithOp::Sub, Value::Date(a), Value::Date(b)) => {
            Ok(Value::Number((*a - *b).num_days() as f64))
        }
        (op, left, right) => Err(format!(
            "cannot compute {} {} {}",
            left.type_name(),
            op.as_str(),
            right.type_name()
        )),
    }
}
