//! The intermediate representation shared by both generators.
//!
//! `Expr` is a closed set of node kinds. The real-time and batch generators
//! match on it exhaustively without a wildcard arm, so a new node kind does
//! not compile until both generators handle it.

use crate::core::{FieldType, Value};
use chrono::NaiveDate;
use std::fmt;

/// A constant written in rule text.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Number(f64),
    Text(String),
    Date(NaiveDate),
    Bool(bool),
}

impl Literal {
    pub fn field_type(&self) -> FieldType {
        match self {
            Literal::Number(_) => FieldType::Number,
            Literal::Text(_) => FieldType::Text,
            Literal::Date(_) => FieldType::Date,
            Literal::Bool(_) => FieldType::Boolean,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Literal::Number(n) => Value::Number(*n),
            Literal::Text(s) => Value::Text(s.clone()),
            Literal::Date(d) => Value::Date(*d),
            Literal::Bool(b) => Value::Bool(*b),
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Number(n) => write!(f, "{n}"),
            Literal::Text(s) => write!(f, "{s:?}"),
            Literal::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Literal::Bool(b) => write!(f, "{b}"),
        }
    }
}

/// A field reference resolved against the schema.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldRef {
    pub name: String,
    pub ty: FieldType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl CompareOp {
    pub fn as_str(self) -> &'static str {
        match self {
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
        }
    }

    /// Whether the operator needs an ordering rather than just equality.
    pub fn is_ordering(self) -> bool {
        !matches!(self, CompareOp::Eq | CompareOp::Ne)
    }

    pub fn apply(self, ordering: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::*;
        match self {
            CompareOp::Lt => ordering == Less,
            CompareOp::Le => ordering != Greater,
            CompareOp::Gt => ordering == Greater,
            CompareOp::Ge => ordering != Less,
            CompareOp::Eq => ordering == Equal,
            CompareOp::Ne => ordering != Equal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArithOp {
    Add,
    Sub,
}

impl ArithOp {
    pub fn as_str(self) -> &'static str {
        match self {
            ArithOp::Add => "+",
            ArithOp::Sub => "-",
        }
    }
}

/// Whitelisted functions. Anything else is rejected by the parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Function {
    Today,
    Length,
    DaysBetween,
    AddDays,
    AddWeeks,
    AddMonths,
    Within,
}

impl Function {
    pub fn from_name(name: &str) -> Option<Self> {
        let function = match name {
            "today" => Self::Today,
            "length" => Self::Length,
            "days_between" => Self::DaysBetween,
            "add_days" => Self::AddDays,
            "add_weeks" => Self::AddWeeks,
            "add_months" => Self::AddMonths,
            "within" => Self::Within,
            _ => return None,
        };
        Some(function)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Today => "today",
            Self::Length => "length",
            Self::DaysBetween => "days_between",
            Self::AddDays => "add_days",
            Self::AddWeeks => "add_weeks",
            Self::AddMonths => "add_months",
            Self::Within => "within",
        }
    }

    pub fn arity(self) -> usize {
        match self {
            Self::Today => 0,
            Self::Length => 1,
            Self::DaysBetween | Self::AddDays | Self::AddWeeks | Self::AddMonths => 2,
            Self::Within => 3,
        }
    }
}

/// Boolean combinators. `And`/`Or` are n-ary and flattened by the parser.
#[derive(Debug, Clone, PartialEq)]
pub enum Logical {
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Literal),
    FieldRef(FieldRef),
    Comparison {
        op: CompareOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// Inclusive on both ends.
    Range {
        value: Box<Expr>,
        low: Box<Expr>,
        high: Box<Expr>,
    },
    InList {
        value: Box<Expr>,
        items: Vec<Literal>,
    },
    NotInList {
        value: Box<Expr>,
        items: Vec<Literal>,
    },
    Logical(Logical),
    /// Each branch holds if all of its conditions hold; an empty branch holds.
    Conditional {
        condition: Box<Expr>,
        then_branch: Vec<Expr>,
        else_branch: Vec<Expr>,
    },
    Required {
        field: FieldRef,
        unless: Option<Box<Expr>>,
    },
    FunctionCall {
        function: Function,
        args: Vec<Expr>,
    },
    Arithmetic {
        op: ArithOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
}

impl Expr {
    /// Number of nodes in the tree.
    pub fn node_count(&self) -> usize {
        1 + match self {
            Expr::Literal(_) | Expr::FieldRef(_) => 0,
            Expr::Comparison { left, right, .. } | Expr::Arithmetic { left, right, .. } => {
                left.node_count() + right.node_count()
            }
            Expr::Range { value, low, high } => {
                value.node_count() + low.node_count() + high.node_count()
            }
            Expr::InList { value, items } | Expr::NotInList { value, items } => {
                value.node_count() + items.len()
            }
            Expr::Logical(Logical::And(children)) | Expr::Logical(Logical::Or(children)) => {
                children.iter().map(Expr::node_count).sum()
            }
            Expr::Logical(Logical::Not(child)) => child.node_count(),
            Expr::Conditional {
                condition,
                then_branch,
                else_branch,
            } => {
                condition.node_count()
                    + then_branch.iter().map(Expr::node_count).sum::<usize>()
                    + else_branch.iter().map(Expr::node_count).sum::<usize>()
            }
            Expr::Required { unless, .. } => unless.as_ref().map_or(0, |u| u.node_count()),
            Expr::FunctionCall { args, .. } => args.iter().map(Expr::node_count).sum(),
        }
    }

    /// Names of all fields the expression reads, in first-use order.
    pub fn referenced_fields(&self) -> Vec<&str> {
        let mut fields = Vec::new();
        self.collect_fields(&mut fields);
        fields
    }

    fn collect_fields<'a>(&'a self, out: &mut Vec<&'a str>) {
        fn push<'a>(name: &'a str, out: &mut Vec<&'a str>) {
            if !out.contains(&name) {
                out.push(name);
            }
        }
        match self {
            Expr::Literal(_) => {}
            Expr::FieldRef(field) => push(&field.name, out),
            Expr::Comparison { left, right, .. } | Expr::Arithmetic { left, right, .. } => {
                left.collect_fields(out);
                right.collect_fields(out);
            }
            Expr::Range { value, low, high } => {
                value.collect_fields(out);
                low.collect_fields(out);
                high.collect_fields(out);
            }
            Expr::InList { value, .. } | Expr::NotInList { value, .. } => {
                value.collect_fields(out)
            }
            Expr::Logical(Logical::And(children)) | Expr::Logical(Logical::Or(children)) => {
                children.iter().for_each(|c| c.collect_fields(out))
            }
            Expr::Logical(Logical::Not(child)) => child.collect_fields(out),
            Expr::Conditional {
                condition,
                then_branch,
                else_branch,
            } => {
                condition.collect_fields(out);
                then_branch.iter().for_each(|c| c.collect_fields(out));
                else_branch.iter().for_each(|c| c.collect_fields(out));
            }
            Expr::Required { field, unless } => {
                push(&field.name, out);
                if let Some(unless) = unless {
                    unless.collect_fields(out);
                }
            }
            Expr::FunctionCall { args, .. } => args.iter().for_each(|c| c.collect_fields(out)),
        }
    }
}

fn join(exprs: &[Expr], separator: &str) -> String {
    exprs
        .iter()
        .map(|e| match e {
            Expr::Logical(Logical::And(_)) | Expr::Logical(Logical::Or(_)) => format!("({e})"),
            _ => e.to_string(),
        })
        .collect::<Vec<_>>()
        .join(separator)
}

fn join_literals(items: &[Literal]) -> String {
    items
        .iter()
        .map(Literal::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Renders the expression back as rule text in canonical form.
impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(literal) => write!(f, "{literal}"),
            Expr::FieldRef(field) => write!(f, "{}", field.name),
            Expr::Comparison { op, left, right } => write!(f, "{left} {} {right}", op.as_str()),
            Expr::Range { value, low, high } => write!(f, "{value} between {low} and {high}"),
            Expr::InList { value, items } => write!(f, "{value} in ({})", join_literals(items)),
            Expr::NotInList { value, items } => {
                write!(f, "{value} not_in ({})", join_literals(items))
            }
            Expr::Logical(Logical::And(children)) => write!(f, "{}", join(children, " and ")),
            Expr::Logical(Logical::Or(children)) => write!(f, "{}", join(children, " or ")),
            Expr::Logical(Logical::Not(child)) => write!(f, "not ({child})"),
            Expr::Conditional {
                condition,
                then_branch,
                else_branch,
            } => {
                write!(f, "if {condition} then {}", join(then_branch, ", "))?;
                if !else_branch.is_empty() {
                    write!(f, " else {}", join(else_branch, ", "))?;
                }
                write!(f, " endif")
            }
            Expr::Required { field, unless } => {
                write!(f, "{} required", field.name)?;
                if let Some(unless) = unless {
                    write!(f, " unless {unless}")?;
                }
                Ok(())
            }
            Expr::FunctionCall { function, args } => {
                if *function == Function::Today {
                    return write!(f, "today");
                }
                write!(f, "{}({})", function.name(), join(args, ", "))
            }
            Expr::Arithmetic { op, left, right } => match **right {
                Expr::Arithmetic { .. } => write!(f, "{left} {} ({right})", op.as_str()),
                _ => write!(f, "{left} {} {right}", op.as_str()),
            },
        }
    }
}
