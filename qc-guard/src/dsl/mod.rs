//! The rule language: lexer, parser, AST and static typing.
//!
//! ```rust
//! use qc_guard::core::{FieldSchema, FieldType};
//! use qc_guard::dsl::{parse_rule, Expr};
//!
//! let schema = FieldSchema::new().field("heart_rate", FieldType::Number);
//! let expr = parse_rule("between 40 and 200", &schema, Some("heart_rate")).unwrap();
//! assert!(matches!(expr, Expr::Range { .. }));
//!
//! // Identifiers must be schema fields, never implicit strings.
//! assert!(parse_rule("hart_rate > 40", &schema, None).is_err());
//! ```

pub mod ast;
pub mod lexer;
pub mod parser;
pub mod token;
pub mod typing;

pub use ast::{ArithOp, CompareOp, Expr, FieldRef, Function, Literal, Logical};
pub use lexer::{tokenize, Lexer};
pub use parser::Parser;
pub use token::{Keyword, Operator, Token, TokenKind};

use crate::core::{FieldSchema, DEFAULT_MAX_RULE_LENGTH};
use crate::error::CompileError;

/// Parses rule text against a schema.
///
/// `subject` is the rule's target field, used when the text omits the left
/// operand (`between 40 and 200`).
pub fn parse_rule(
    source: &str,
    schema: &FieldSchema,
    subject: Option<&str>,
) -> Result<Expr, CompileError> {
    parser::parse_with_limit(source, schema, subject, DEFAULT_MAX_RULE_LENGTH)
}

/// Like [`parse_rule`] with a caller-supplied limit on rule text length.
pub fn parse_rule_with_limit(
    source: &str,
    schema: &FieldSchema,
    subject: Option<&str>,
    max_length: usize,
) -> Result<Expr, CompileError> {
    parser::parse_with_limit(source, schema, subject, max_length)
}
