//! Error types for the qc-guard rule engine.
//!
//! Compile-time diagnostics (`LexError`, `ParseError`, `SemanticError`,
//! `CompileError`) are returned to the rule-authoring surface so rules can be
//! corrected before activation. Run-time failures of the batch engine are
//! represented by `QcError`; the real-time hot path never produces an error.

use thiserror::Error;

/// The rule text could not be tokenized.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unexpected character {unexpected:?} at offset {position}{}", detail_suffix(.detail))]
pub struct LexError {
    /// Byte offset of the offending character
    pub position: usize,
    /// The character the lexer could not accept
    pub unexpected: char,
    /// Extra context, e.g. "unterminated string literal"
    pub detail: Option<String>,
}

fn detail_suffix(detail: &Option<String>) -> String {
    match detail {
        Some(d) => format!(" ({d})"),
        None => String::new(),
    }
}

impl LexError {
    pub(crate) fn new(position: usize, unexpected: char) -> Self {
        Self {
            position,
            unexpected,
            detail: None,
        }
    }

    pub(crate) fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// The token stream does not match the rule grammar.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Expected {expected} at offset {position}, found {found}")]
pub struct ParseError {
    /// Byte offset of the token that failed to match
    pub position: usize,
    /// Human-readable description of what the grammar allowed here
    pub expected: String,
    /// Human-readable description of the token actually present
    pub found: String,
}

impl ParseError {
    pub(crate) fn new(
        position: usize,
        expected: impl Into<String>,
        found: impl Into<String>,
    ) -> Self {
        Self {
            position,
            expected: expected.into(),
            found: found.into(),
        }
    }
}

/// The kind of semantic problem found while resolving a parsed rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SemanticErrorKind {
    /// An identifier does not name a field in the schema
    UnknownField(String),
    /// A call names a function outside the whitelist
    UnknownFunction(String),
    /// A whitelisted function was called with the wrong number of arguments
    Arity {
        function: String,
        expected: usize,
        found: usize,
    },
    /// Operand types are incompatible
    TypeMismatch { expected: String, found: String },
    /// A subject-less form (e.g. `between 1 and 2`) in a rule without a target field
    MissingSubject,
    /// The rule as a whole does not evaluate to a boolean
    NotBoolean(String),
}

impl std::fmt::Display for SemanticErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownField(name) => write!(f, "unknown field reference '{name}'"),
            Self::UnknownFunction(name) => write!(f, "unknown function '{name}'"),
            Self::Arity {
                function,
                expected,
                found,
            } => write!(
                f,
                "function '{function}' takes {expected} argument(s), {found} given"
            ),
            Self::TypeMismatch { expected, found } => {
                write!(f, "type mismatch: expected {expected}, found {found}")
            }
            Self::MissingSubject => write!(
                f,
                "rule has no target field, so the subject of this condition must be written out"
            ),
            Self::NotBoolean(ty) => write!(f, "rule must be a condition, found a {ty} value"),
        }
    }
}

/// A syntactically valid rule that refers to something it may not.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Semantic error at offset {position}: {kind}")]
pub struct SemanticError {
    /// Byte offset of the construct that failed resolution
    pub position: usize,
    /// What went wrong
    pub kind: SemanticErrorKind,
}

impl SemanticError {
    pub(crate) fn new(position: usize, kind: SemanticErrorKind) -> Self {
        Self { position, kind }
    }
}

/// Errors produced while turning rule text into an executable form.
///
/// Front-end errors are wrapped so that a single compile call surfaces every
/// compile-time diagnostic as one type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error(transparent)]
    Lex(#[from] LexError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Semantic(#[from] SemanticError),

    /// The generator cannot express this AST shape.
    #[error("Unsupported by the {target} generator: {message}")]
    Unsupported {
        target: &'static str,
        message: String,
    },

    /// A field name was not on the schema whitelist (or is unsafe as an identifier).
    #[error("Field '{field}' is not a recognised column: {reason}")]
    UnknownColumn { field: String, reason: String },

    /// A batch template was configured inconsistently with the schema.
    #[error("Invalid template '{template}': {message}")]
    Template {
        template: &'static str,
        message: String,
    },
}

impl CompileError {
    pub(crate) fn unsupported(target: &'static str, message: impl Into<String>) -> Self {
        Self::Unsupported {
            target,
            message: message.into(),
        }
    }

    pub(crate) fn template(template: &'static str, message: impl Into<String>) -> Self {
        Self::Template {
            template,
            message: message.into(),
        }
    }

    /// Returns true for errors detected before any generator ran.
    pub fn is_front_end(&self) -> bool {
        matches!(self, Self::Lex(_) | Self::Parse(_) | Self::Semantic(_))
    }
}

/// The main error type for qc-guard.
#[derive(Error, Debug)]
pub enum QcError {
    /// A rule failed to compile.
    #[error("Rule '{rule_id}' failed to compile: {source}")]
    Compile {
        rule_id: String,
        #[source]
        source: CompileError,
    },

    /// A batch rule's query failed while running.
    #[error("Execution of rule '{rule_id}' failed: {message}")]
    Execution { rule_id: String, message: String },

    /// Error from DataFusion operations.
    #[error("DataFusion error: {0}")]
    DataFusion(#[from] datafusion::error::DataFusionError),

    /// Error from Arrow operations.
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    /// Error raised by a violation repository backend.
    #[error("Storage error in {backend} during {operation}: {message}")]
    Storage {
        backend: String,
        operation: String,
        message: String,
    },

    /// Another batch run holds the advisory lock for this dataset.
    #[error("A QC run is already in progress for dataset '{dataset}'")]
    RunInProgress { dataset: String },

    /// Error related to configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Security-related error (unsafe identifiers and the like).
    #[error("Security error: {0}")]
    SecurityError(String),

    /// Generic internal error for unexpected conditions.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A type alias for `Result<T, QcError>`.
pub type Result<T> = std::result::Result<T, QcError>;

impl QcError {
    /// Creates a compile error attributed to a rule.
    pub fn compile(rule_id: impl Into<String>, source: CompileError) -> Self {
        Self::Compile {
            rule_id: rule_id.into(),
            source,
        }
    }

    /// Creates an execution error attributed to a rule.
    pub fn execution(rule_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Execution {
            rule_id: rule_id.into(),
            message: message.into(),
        }
    }

    /// Creates a storage error.
    pub fn storage(
        backend: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Storage {
            backend: backend.into(),
            operation: operation.into(),
            message: message.into(),
        }
    }
}
