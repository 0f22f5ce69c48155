//! Typed errors for every fallible stage of the engine: lexing, parsing,
//! the safety gate, evaluation, and the digest scheduler.

use thiserror::Error;

/// A source location, carried by every token and error so diagnostics can
/// point back at the offending text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Span {
    pub start: usize,
    pub end: usize,
    pub line: usize,
    pub column: usize,
}

impl Span {
    pub fn new(start: usize, end: usize, line: usize, column: usize) -> Self {
        Self { start, end, line, column }
    }

    pub fn merge(self, other: Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
            line: self.line,
            column: self.column,
        }
    }
}

/// Lexical failures (spec §4.1).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LexError {
    #[error("unexpected character '{ch}' at line {}, column {}", span.line, span.column)]
    UnexpectedChar { ch: char, span: Span },

    #[error("unterminated string literal at line {}, column {}", span.line, span.column)]
    UnterminatedString { span: Span },

    #[error("invalid escape sequence '\\{ch}' at line {}, column {}", span.line, span.column)]
    InvalidEscape { ch: char, span: Span },

    #[error("invalid unicode escape at line {}, column {}", span.line, span.column)]
    InvalidUnicodeEscape { span: Span },

    #[error("invalid number literal '{text}' at line {}, column {}", span.line, span.column)]
    InvalidNumber { text: String, span: Span },
}

impl LexError {
    pub fn span(&self) -> Span {
        match self {
            LexError::UnexpectedChar { span, .. }
            | LexError::UnterminatedString { span }
            | LexError::InvalidEscape { span, .. }
            | LexError::InvalidUnicodeEscape { span }
            | LexError::InvalidNumber { span, .. } => *span,
        }
    }
}

/// Grammar failures (spec §4.2), layered on top of lexical ones.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error(transparent)]
    LexerError(#[from] LexError),

    #[error("Unexpected! Expecting: {expected} at line {}, column {}", span.line, span.column)]
    UnexpectedToken { expected: String, span: Span },

    #[error("Unexpected end of expression, expecting: {expected}")]
    UnexpectedEof { expected: String },

    #[error("invalid assignment target at line {}, column {}", span.line, span.column)]
    InvalidAssignmentTarget { span: Span },
}

impl ParseError {
    pub fn span(&self) -> Span {
        match self {
            ParseError::LexerError(e) => e.span(),
            ParseError::UnexpectedToken { span, .. } => *span,
            ParseError::UnexpectedEof { .. } => Span::default(),
            ParseError::InvalidAssignmentTarget { span } => *span,
        }
    }
}

/// Safety gate refusals (spec §4.3): kind 2 of the error taxonomy.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SafetyError {
    #[error("Attempting to access a disallowed field: {name}")]
    DisallowedField { name: String },

    #[error("Attempting to access a disallowed builtin: {name}")]
    DisallowedBuiltin { name: String },

    #[error("Referencing the global environment is disallowed")]
    DisallowedGlobal,

    #[error("Referencing DOM nodes is disallowed")]
    DisallowedDomLike,

    #[error("Referencing a value's own constructor is disallowed")]
    DisallowedConstructor,

    #[error("Referencing the root Object is disallowed")]
    DisallowedRootObject,
}

/// Runtime evaluation faults (spec §7 kind 3): bad member access, user
/// callable failures, and safety gate refusals surfaced during evaluation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EvalError {
    #[error(transparent)]
    Safety(#[from] SafetyError),

    #[error("cannot read property '{property}' of {receiver}")]
    PropertyOfNonObject { property: String, receiver: &'static str },

    #[error("'{name}' is not a function")]
    NotCallable { name: String },

    #[error("{0}")]
    Custom(String),
}

/// Digest scheduler failures (spec §7 kinds 4 and 5).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DigestError {
    #[error("Maximum $watch TTL exceeded")]
    TtlExceeded,

    #[error("{phase} already in progress")]
    ReentrantPhase { phase: &'static str },
}

/// The union of every error kind, for call sites that need one type
/// (e.g. `Scope::$eval`).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Safety(#[from] SafetyError),
    #[error(transparent)]
    Eval(#[from] EvalError),
    #[error(transparent)]
    Digest(#[from] DigestError),
}

impl From<LexError> for EngineError {
    fn from(e: LexError) -> Self {
        EngineError::Parse(ParseError::LexerError(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disallowed_field_message_names_the_field() {
        let err = SafetyError::DisallowedField { name: "constructor".into() };
        assert_eq!(err.to_string(), "Attempting to access a disallowed field: constructor");
    }

    #[test]
    fn parse_error_wraps_lex_error_transparently() {
        let lex = LexError::UnexpectedChar { ch: '#', span: Span::new(0, 1, 1, 1) };
        let parse: ParseError = lex.clone().into();
        assert_eq!(parse.to_string(), lex.to_string());
    }

    #[test]
    fn ttl_exceeded_message_matches_spec_wording() {
        assert_eq!(DigestError::TtlExceeded.to_string(), "Maximum $watch TTL exceeded");
    }
}
