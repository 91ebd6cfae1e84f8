//! Static types of rule expressions.
//!
//! The parser checks every node as it is built, so a tree that reached a
//! generator is well typed and [`type_of`] never has to fail.

use super::ast::{ArithOp, Expr, Function, Literal, Logical};
use crate::core::FieldType;
use crate::error::SemanticErrorKind;

/// The type an expression evaluates to.
pub fn type_of(expr: &Expr) -> FieldType {
    match expr {
        Expr::Literal(literal) => literal.field_type(),
        Expr::FieldRef(field) => field.ty,
        Expr::Comparison { .. }
        | Expr::Range { .. }
        | Expr::InList { .. }
        | Expr::NotInList { .. }
        | Expr::Logical(_)
        | Expr::Conditional { .. }
        | Expr::Required { .. } => FieldType::Boolean,
        Expr::FunctionCall { function, .. } => result_type(*function),
        Expr::Arithmetic { op, left, right } => arithmetic_type(*op, type_of(left), type_of(right))
            .unwrap_or(FieldType::Number),
    }
}

fn result_type(function: Function) -> FieldType {
    match function {
        Function::Today | Function::AddDays | Function::AddWeeks | Function::AddMonths => {
            FieldType::Date
        }
        Function::Length | Function::DaysBetween => FieldType::Number,
        Function::Within => FieldType::Boolean,
    }
}

/// `number ± number`, `date ± number`, `number + date` and `date - date`.
fn arithmetic_type(op: ArithOp, left: FieldType, right: FieldType) -> Option<FieldType> {
    use FieldType::*;
    match (op, left, right) {
        (_, Number, Number) => Some(Number),
        (_, Date, Number) => Some(Date),
        (ArithOp::Add, Number, Date) => Some(Date),
        (ArithOp::Sub, Date, Date) => Some(Number),
        _ => None,
    }
}

fn expect(expected: FieldType, expr: &Expr) -> Result<(), SemanticErrorKind> {
    let found = type_of(expr);
    if found == expected {
        Ok(())
    } else {
        Err(mismatch(expected.to_string(), found))
    }
}

fn mismatch(expected: impl Into<String>, found: FieldType) -> SemanticErrorKind {
    SemanticErrorKind::TypeMismatch {
        expected: expected.into(),
        found: found.to_string(),
    }
}

fn expect_same(left: FieldType, right: FieldType) -> Result<(), SemanticErrorKind> {
    if left == right {
        Ok(())
    } else {
        Err(mismatch(left.to_string(), right))
    }
}

fn expect_items(value: FieldType, items: &[Literal]) -> Result<(), SemanticErrorKind> {
    items
        .iter()
        .try_for_each(|item| expect_same(value, item.field_type()))
}

/// Checks one node against the types of its (already checked) children.
pub fn check_node(expr: &Expr) -> Result<FieldType, SemanticErrorKind> {
    match expr {
        Expr::Literal(_) | Expr::FieldRef(_) => {}
        Expr::Comparison { op, left, right } => {
            let left = type_of(left);
            expect_same(left, type_of(right))?;
            if op.is_ordering() && left == FieldType::Boolean {
                return Err(mismatch("number, text or date", left));
            }
        }
        Expr::Range { value, low, high } => {
            let ty = type_of(value);
            if !matches!(ty, FieldType::Number | FieldType::Date) {
                return Err(mismatch("number or date", ty));
            }
            expect(ty, low)?;
            expect(ty, high)?;
        }
        Expr::InList { value, items } | Expr::NotInList { value, items } => {
            expect_items(type_of(value), items)?;
        }
        Expr::Logical(Logical::And(children)) | Expr::Logical(Logical::Or(children)) => {
            children
                .iter()
                .try_for_each(|child| expect(FieldType::Boolean, child))?;
        }
        Expr::Logical(Logical::Not(child)) => expect(FieldType::Boolean, child)?,
        Expr::Conditional {
            condition,
            then_branch,
            else_branch,
        } => {
            expect(FieldType::Boolean, condition)?;
            then_branch
                .iter()
                .chain(else_branch)
                .try_for_each(|branch| expect(FieldType::Boolean, branch))?;
        }
        Expr::Required { unless, .. } => {
            if let Some(unless) = unless {
                expect(FieldType::Boolean, unless)?;
            }
        }
        Expr::FunctionCall { function, args } => {
            if args.len() != function.arity() {
                return Err(SemanticErrorKind::Arity {
                    function: function.name().to_string(),
                    expected: function.arity(),
                    found: args.len(),
                });
            }
            let params: &[FieldType] = match function {
                Function::Today => &[],
                Function::Length => &[FieldType::Text],
                Function::DaysBetween => &[FieldType::Date, FieldType::Date],
                Function::AddDays | Function::AddWeeks | Function::AddMonths => {
                    &[FieldType::Date, FieldType::Number]
                }
                Function::Within => &[FieldType::Date, FieldType::Date, FieldType::Number],
            };
            params
                .iter()
                .zip(args)
                .try_for_each(|(ty, arg)| expect(*ty, arg))?;
        }
        Expr::Arithmetic { op, left, right } => {
            let (l, r) = (type_of(left), type_of(right));
            if arithmetic_type(*op, l, r).is_none() {
                return Err(SemanticErrorKind::TypeMismatch {
                    expected: "number or date operands".to_string(),
                    found: format!("{l} {} {r}", op.as_str()),
                });
            }
        }
    }
    Ok(type_of(expr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsl::ast::{CompareOp, FieldRef};
    use chrono::NaiveDate;

    fn field(name: &str, ty: FieldType) -> Box<Expr> {
        Box::new(Expr::FieldRef(FieldRef {
            name: name.into(),
            ty,
        }))
    }

    fn number(n: f64) -> Box<Expr> {
        Box::new(Expr::Literal(Literal::Number(n)))
    }

    #[test]
    fn test_date_arithmetic_types() {
        let expr = Expr::Arithmetic {
            op: ArithOp::Add,
            left: field("d", FieldType::Date),
            right: number(7.0),
        };
        assert_eq!(check_node(&expr), Ok(FieldType::Date));

        let expr = Expr::Arithmetic {
            op: ArithOp::Sub,
            left: field("a", FieldType::Date),
            right: field("b", FieldType::Date),
        };
        assert_eq!(check_node(&expr), Ok(FieldType::Number));

        let expr = Expr::Arithmetic {
            op: ArithOp::Sub,
            left: number(1.0),
            right: field("b", FieldType::Date),
        };
        assert!(check_node(&expr).is_err());
    }

    #[test]
    fn test_comparison_requires_matching_types() {
        let expr = Expr::Comparison {
            op: CompareOp::Gt,
            left: field("hr", FieldType::Number),
            right: Box::new(Expr::Literal(Literal::Text("high".into()))),
        };
        assert!(matches!(
            check_node(&expr),
            Err(SemanticErrorKind::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_boolean_ordering_rejected() {
        let expr = Expr::Comparison {
            op: CompareOp::Lt,
            left: field("flag", FieldType::Boolean),
            right: Box::new(Expr::Literal(Literal::Bool(true))),
        };
        assert!(check_node(&expr).is_err());
    }

    #[test]
    fn test_function_signature() {
        let expr = Expr::FunctionCall {
            function: Function::Length,
            args: vec![*field("hr", FieldType::Number)],
        };
        assert!(check_node(&expr).is_err());

        let expr = Expr::FunctionCall {
            function: Function::Within,
            args: vec![
                *field("a", FieldType::Date),
                Expr::Literal(Literal::Date(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap())),
                *number(30.0),
            ],
        };
        assert_eq!(check_node(&expr), Ok(FieldType::Boolean));
    }
}
