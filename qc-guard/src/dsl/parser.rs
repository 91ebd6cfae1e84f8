//! Recursive-descent parser.
//!
//! Grammar, lowest precedence first:
//!
//! ```text
//! rule      := or EOF
//! or        := and ("or" and)*
//! and       := not ("and" not)*
//! not       := "not" not | predicate
//! predicate := "between" additive "and" additive          (implicit subject)
//!            | cmp additive | list | "required" guard      (implicit subject)
//!            | additive suffix?
//! suffix    := cmp additive
//!            | "between" additive "and" additive
//!            | ("in" | "not_in" | "not" "in") list
//!            | "required" guard
//!            | "within" additive "days" "of" additive
//! guard     := ("unless" or)?
//! additive  := primary (("+" | "-") primary)*
//! primary   := literal | field | function "(" args ")" | "today" ("(" ")")?
//!            | "(" or ")" | "if" or "then" branch ("else" branch)? "endif"
//! branch    := (or ("," or)*)?
//! list      := "(" literal ("," literal)* ")"
//! ```
//!
//! Identifiers must name schema fields. Every node is type checked as it is
//! built, and no error is ever recovered from.

use super::ast::{ArithOp, CompareOp, Expr, FieldRef, Function, Literal, Logical};
use super::lexer::Lexer;
use super::token::{Keyword, Operator, Token, TokenKind};
use super::typing;
use crate::core::{FieldSchema, FieldType};
use crate::error::{CompileError, ParseError, SemanticError, SemanticErrorKind};

/// Deepest nesting of parentheses, conditionals, calls and `not` accepted.
pub const MAX_NESTING_DEPTH: usize = 128;

pub struct Parser<'a> {
    tokens: Vec<Token>,
    cursor: usize,
    depth: usize,
    schema: &'a FieldSchema,
    subject: Option<&'a str>,
}

impl<'a> Parser<'a> {
    /// Creates a parser over a lexed token stream ending in `Eof`.
    pub fn new(tokens: Vec<Token>, schema: &'a FieldSchema, subject: Option<&'a str>) -> Self {
        Self {
            tokens,
            cursor: 0,
            depth: 0,
            schema,
            subject,
        }
    }

    /// Parses a complete rule, which must be a condition.
    pub fn parse(mut self) -> Result<Expr, CompileError> {
        let start = self.offset();
        let expr = self.parse_or()?;
        if !matches!(self.peek(), TokenKind::Eof) {
            return Err(self.unexpected("end of rule").into());
        }
        let ty = typing::type_of(&expr);
        if ty != FieldType::Boolean {
            return Err(
                SemanticError::new(start, SemanticErrorKind::NotBoolean(ty.to_string())).into(),
            );
        }
        Ok(expr)
    }

    fn parse_or(&mut self) -> Result<Expr, CompileError> {
        self.enter()?;
        let expr = self.parse_disjunction();
        self.depth -= 1;
        expr
    }

    fn parse_disjunction(&mut self) -> Result<Expr, CompileError> {
        let start = self.offset();
        let mut children = vec![self.parse_and()?];
        while self.consume_keyword(Keyword::Or) {
            children.push(self.parse_and()?);
        }
        if children.len() == 1 {
            return Ok(children.remove(0));
        }
        self.checked(start, Expr::Logical(Logical::Or(children)))
    }

    fn parse_and(&mut self) -> Result<Expr, CompileError> {
        let start = self.offset();
        let mut children = vec![self.parse_not()?];
        while self.consume_keyword(Keyword::And) {
            children.push(self.parse_not()?);
        }
        if children.len() == 1 {
            return Ok(children.remove(0));
        }
        self.checked(start, Expr::Logical(Logical::And(children)))
    }

    fn parse_not(&mut self) -> Result<Expr, CompileError> {
        let start = self.offset();
        if self.consume_keyword(Keyword::Not) {
            self.enter()?;
            let child = self.parse_not();
            self.depth -= 1;
            return self.checked(start, Expr::Logical(Logical::Not(Box::new(child?))));
        }
        self.parse_predicate()
    }

    fn parse_predicate(&mut self) -> Result<Expr, CompileError> {
        let start = self.offset();
        let implicit = match self.peek() {
            TokenKind::Keyword(Keyword::Between)
            | TokenKind::Keyword(Keyword::In)
            | TokenKind::Keyword(Keyword::NotIn)
            | TokenKind::Keyword(Keyword::Required) => true,
            TokenKind::Operator(op) => compare_op(*op).is_some(),
            _ => false,
        };
        let subject = if implicit {
            self.subject(start)?
        } else {
            self.parse_additive()?
        };
        self.parse_suffix(start, subject)
    }

    fn parse_suffix(&mut self, start: usize, subject: Expr) -> Result<Expr, CompileError> {
        let expr = match self.peek().clone() {
            TokenKind::Operator(op) => match compare_op(op) {
                Some(op) => {
                    self.cursor += 1;
                    let right = self.parse_additive()?;
                    Expr::Comparison {
                        op,
                        left: Box::new(subject),
                        right: Box::new(right),
                    }
                }
                None => return Ok(subject),
            },
            TokenKind::Keyword(Keyword::Between) => {
                self.cursor += 1;
                let low = self.parse_additive()?;
                self.expect_keyword(Keyword::And)?;
                let high = self.parse_additive()?;
                Expr::Range {
                    value: Box::new(subject),
                    low: Box::new(low),
                    high: Box::new(high),
                }
            }
            TokenKind::Keyword(Keyword::In) => {
                self.cursor += 1;
                Expr::InList {
                    value: Box::new(subject),
                    items: self.parse_list()?,
                }
            }
            TokenKind::Keyword(Keyword::NotIn) => {
                self.cursor += 1;
                Expr::NotInList {
                    value: Box::new(subject),
                    items: self.parse_list()?,
                }
            }
            TokenKind::Keyword(Keyword::Not)
                if matches!(self.peek_at(1), TokenKind::Keyword(Keyword::In)) =>
            {
                self.cursor += 2;
                Expr::NotInList {
                    value: Box::new(subject),
                    items: self.parse_list()?,
                }
            }
            TokenKind::Keyword(Keyword::Required) => {
                let Expr::FieldRef(field) = subject else {
                    return Err(ParseError::new(
                        start,
                        "a field name before 'required'",
                        "an expression",
                    )
                    .into());
                };
                self.cursor += 1;
                let unless = if self.consume_keyword(Keyword::Unless) {
                    Some(Box::new(self.parse_or()?))
                } else {
                    None
                };
                Expr::Required { field, unless }
            }
            TokenKind::Keyword(Keyword::Within) => {
                self.cursor += 1;
                let days = self.parse_additive()?;
                self.expect_keyword(Keyword::Days)?;
                self.expect_keyword(Keyword::Of)?;
                let other = self.parse_additive()?;
                Expr::FunctionCall {
                    function: Function::Within,
                    args: vec![subject, other, days],
                }
            }
            _ => return Ok(subject),
        };
        self.checked(start, expr)
    }

    fn parse_additive(&mut self) -> Result<Expr, CompileError> {
        let start = self.offset();
        let mut expr = self.parse_primary()?;
        loop {
            let op = match self.peek() {
                TokenKind::Operator(Operator::Plus) => ArithOp::Add,
                TokenKind::Operator(Operator::Minus) => ArithOp::Sub,
                _ => break,
            };
            self.cursor += 1;
            let right = self.parse_primary()?;
            expr = self.checked(
                start,
                Expr::Arithmetic {
                    op,
                    left: Box::new(expr),
                    right: Box::new(right),
                },
            )?;
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, CompileError> {
        let start = self.offset();
        match self.peek().clone() {
            TokenKind::Number(_)
            | TokenKind::Str(_)
            | TokenKind::Date(_)
            | TokenKind::Keyword(Keyword::True)
            | TokenKind::Keyword(Keyword::False)
            | TokenKind::Operator(Operator::Minus) => Ok(Expr::Literal(self.parse_literal()?)),
            TokenKind::Keyword(Keyword::Today) => {
                self.cursor += 1;
                if self.consume(&TokenKind::LParen) {
                    self.expect(&TokenKind::RParen, "')'")?;
                }
                Ok(Expr::FunctionCall {
                    function: Function::Today,
                    args: Vec::new(),
                })
            }
            TokenKind::Keyword(Keyword::Within)
                if matches!(self.peek_at(1), TokenKind::LParen) =>
            {
                self.cursor += 1;
                self.parse_call(start, Keyword::Within.as_str())
            }
            TokenKind::Identifier(name) => {
                self.cursor += 1;
                if matches!(self.peek(), TokenKind::LParen) {
                    return self.parse_call(start, &name);
                }
                Ok(Expr::FieldRef(self.resolve(start, &name)?))
            }
            TokenKind::LParen => {
                self.cursor += 1;
                let expr = self.parse_or()?;
                self.expect(&TokenKind::RParen, "')'")?;
                Ok(expr)
            }
            TokenKind::Keyword(Keyword::If) => self.parse_conditional(),
            _ => Err(self.unexpected("an expression").into()),
        }
    }

    fn parse_conditional(&mut self) -> Result<Expr, CompileError> {
        let start = self.offset();
        self.expect_keyword(Keyword::If)?;
        let condition = self.parse_or()?;
        self.expect_keyword(Keyword::Then)?;
        let then_branch = self.parse_branch()?;
        let else_branch = if self.consume_keyword(Keyword::Else) {
            self.parse_branch()?
        } else {
            Vec::new()
        };
        self.expect_keyword(Keyword::Endif)?;
        self.checked(
            start,
            Expr::Conditional {
                condition: Box::new(condition),
                then_branch,
                else_branch,
            },
        )
    }

    fn parse_branch(&mut self) -> Result<Vec<Expr>, CompileError> {
        let mut branch = Vec::new();
        if matches!(
            self.peek(),
            TokenKind::Keyword(Keyword::Else) | TokenKind::Keyword(Keyword::Endif)
        ) {
            return Ok(branch);
        }
        branch.push(self.parse_or()?);
        while self.consume(&TokenKind::Comma) {
            branch.push(self.parse_or()?);
        }
        Ok(branch)
    }

    fn parse_call(&mut self, start: usize, name: &str) -> Result<Expr, CompileError> {
        let Some(function) = Function::from_name(name) else {
            return Err(SemanticError::new(
                start,
                SemanticErrorKind::UnknownFunction(name.to_string()),
            )
            .into());
        };
        self.expect(&TokenKind::LParen, "'('")?;
        let mut args = Vec::new();
        if !self.consume(&TokenKind::RParen) {
            loop {
                args.push(self.parse_or()?);
                if self.consume(&TokenKind::Comma) {
                    continue;
                }
                self.expect(&TokenKind::RParen, "',' or ')'")?;
                break;
            }
        }
        self.checked(start, Expr::FunctionCall { function, args })
    }

    fn parse_list(&mut self) -> Result<Vec<Literal>, CompileError> {
        self.expect(&TokenKind::LParen, "'('")?;
        let mut items = vec![self.parse_literal()?];
        while self.consume(&TokenKind::Comma) {
            items.push(self.parse_literal()?);
        }
        self.expect(&TokenKind::RParen, "',' or ')'")?;
        Ok(items)
    }

    fn parse_literal(&mut self) -> Result<Literal, CompileError> {
        let negative = self.consume(&TokenKind::Operator(Operator::Minus));
        let literal = match self.peek().clone() {
            TokenKind::Number(n) => Literal::Number(if negative { -n } else { n }),
            _ if negative => return Err(self.unexpected("a number after '-'").into()),
            TokenKind::Str(s) => Literal::Text(s),
            TokenKind::Date(d) => Literal::Date(d),
            TokenKind::Keyword(Keyword::True) => Literal::Bool(true),
            TokenKind::Keyword(Keyword::False) => Literal::Bool(false),
            _ => return Err(self.unexpected("a literal").into()),
        };
        self.cursor += 1;
        Ok(literal)
    }

    /// The rule's target field, standing in for an omitted left operand.
    fn subject(&self, start: usize) -> Result<Expr, CompileError> {
        let Some(subject) = self.subject else {
            return Err(SemanticError::new(start, SemanticErrorKind::MissingSubject).into());
        };
        Ok(Expr::FieldRef(self.resolve(start, subject)?))
    }

    fn resolve(&self, offset: usize, name: &str) -> Result<FieldRef, SemanticError> {
        match self.schema.field_type(name) {
            Some(ty) => Ok(FieldRef {
                name: name.to_string(),
                ty,
            }),
            None => Err(SemanticError::new(
                offset,
                SemanticErrorKind::UnknownField(name.to_string()),
            )),
        }
    }

    /// Counts one level of nesting; callers decrement `depth` on the way out.
    fn enter(&mut self) -> Result<(), ParseError> {
        if self.depth >= MAX_NESTING_DEPTH {
            return Err(ParseError::new(
                self.offset(),
                format!("at most {MAX_NESTING_DEPTH} levels of nesting"),
                self.peek().to_string(),
            ));
        }
        self.depth += 1;
        Ok(())
    }

    fn checked(&self, offset: usize, expr: Expr) -> Result<Expr, CompileError> {
        typing::check_node(&expr).map_err(|kind| SemanticError::new(offset, kind))?;
        Ok(expr)
    }

    fn peek(&self) -> &TokenKind {
        self.peek_at(0)
    }

    fn peek_at(&self, ahead: usize) -> &TokenKind {
        self.tokens
            .get(self.cursor + ahead)
            .map(|token| &token.kind)
            .unwrap_or(&TokenKind::Eof)
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.cursor)
            .or_else(|| self.tokens.last())
            .map_or(0, |token| token.offset)
    }

    fn consume(&mut self, kind: &TokenKind) -> bool {
        if self.peek() == kind {
            self.cursor += 1;
            return true;
        }
        false
    }

    fn consume_keyword(&mut self, keyword: Keyword) -> bool {
        self.consume(&TokenKind::Keyword(keyword))
    }

    fn expect(&mut self, kind: &TokenKind, expected: &str) -> Result<(), ParseError> {
        if self.consume(kind) {
            Ok(())
        } else {
            Err(self.unexpected(expected))
        }
    }

    fn expect_keyword(&mut self, keyword: Keyword) -> Result<(), ParseError> {
        self.expect(
            &TokenKind::Keyword(keyword),
            &format!("'{}'", keyword.as_str()),
        )
    }

    fn unexpected(&self, expected: &str) -> ParseError {
        ParseError::new(self.offset(), expected, self.peek().to_string())
    }
}

fn compare_op(op: Operator) -> Option<CompareOp> {
    match op {
        Operator::Lt => Some(CompareOp::Lt),
        Operator::Le => Some(CompareOp::Le),
        Operator::Gt => Some(CompareOp::Gt),
        Operator::Ge => Some(CompareOp::Ge),
        Operator::Eq => Some(CompareOp::Eq),
        Operator::Ne => Some(CompareOp::Ne),
        Operator::Plus | Operator::Minus => None,
    }
}

/// Lexes and parses rule text with an explicit length limit.
pub fn parse_with_limit(
    source: &str,
    schema: &FieldSchema,
    subject: Option<&str>,
    max_length: usize,
) -> Result<Expr, CompileError> {
    let tokens = Lexer::new(source).with_max_length(max_length).tokenize()?;
    Parser::new(tokens, schema, subject).parse()
}
