//! Tokens produced by the lexer.

use chrono::NaiveDate;
use std::fmt;

/// Reserved words of the rule language. Keywords are lowercase only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Keyword {
    Between,
    And,
    Or,
    Not,
    In,
    NotIn,
    If,
    Then,
    Else,
    Endif,
    Required,
    Unless,
    Within,
    Days,
    Of,
    Today,
    True,
    False,
}

impl Keyword {
    /// Looks up a word; `None` means the word is an identifier.
    pub fn from_word(word: &str) -> Option<Self> {
        let keyword = match word {
            "between" => Self::Between,
            "and" => Self::And,
            "or" => Self::Or,
            "not" => Self::Not,
            "in" => Self::In,
            "not_in" => Self::NotIn,
            "if" => Self::If,
            "then" => Self::Then,
            "else" => Self::Else,
            "endif" => Self::Endif,
            "required" => Self::Required,
            "unless" => Self::Unless,
            "within" => Self::Within,
            "days" => Self::Days,
            "of" => Self::Of,
            "today" => Self::Today,
            "true" => Self::True,
            "false" => Self::False,
            _ => return None,
        };
        Some(keyword)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Between => "between",
            Self::And => "and",
            Self::Or => "or",
            Self::Not => "not",
            Self::In => "in",
            Self::NotIn => "not_in",
            Self::If => "if",
            Self::Then => "then",
            Self::Else => "else",
            Self::Endif => "endif",
            Self::Required => "required",
            Self::Unless => "unless",
            Self::Within => "within",
            Self::Days => "days",
            Self::Of => "of",
            Self::Today => "today",
            Self::True => "true",
            Self::False => "false",
        }
    }
}

/// Comparison and arithmetic operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    Plus,
    Minus,
}

impl Operator {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Plus => "+",
            Self::Minus => "-",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Identifier(String),
    Number(f64),
    Str(String),
    Date(NaiveDate),
    Keyword(Keyword),
    Operator(Operator),
    LParen,
    RParen,
    Comma,
    Eof,
}

/// One lexeme with the byte offset it starts at.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub offset: usize,
}

impl Token {
    pub fn new(kind: TokenKind, offset: usize) -> Self {
        Self { kind, offset }
    }

    pub fn is_keyword(&self, keyword: Keyword) -> bool {
        self.kind == TokenKind::Keyword(keyword)
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Identifier(name) => write!(f, "identifier '{name}'"),
            TokenKind::Number(n) => write!(f, "number {n}"),
            TokenKind::Str(s) => write!(f, "string \"{s}\""),
            TokenKind::Date(d) => write!(f, "date {}", d.format("%Y-%m-%d")),
            TokenKind::Keyword(k) => write!(f, "'{}'", k.as_str()),
            TokenKind::Operator(op) => write!(f, "'{}'", op.as_str()),
            TokenKind::LParen => write!(f, "'('"),
            TokenKind::RParen => write!(f, "')'"),
            TokenKind::Comma => write!(f, "','"),
            TokenKind::Eof => write!(f, "end of input"),
        }
    }
}
