//! Stream-of-characters to stream-of-tokens (spec §4.1).
//!
//! The lexer is hand-rolled rather than built on a generated DFA: the
//! grammar is small and fixed, and a direct `Peekable<CharIndices>` scan
//! reads as directly as the rules themselves.

use crate::error::{LexError, Span};
use crate::value::Value;
use std::iter::Peekable;
use std::str::CharIndices;

/// The kind of a single token. Grouped by what the parser does with them.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TokenKind {
    // === Literals ===
    /// A numeric literal, already parsed to `f64`.
    Number(f64),
    /// A string literal, with escapes already resolved.
    String(String),
    /// `true` / `false`.
    Bool(bool),
    /// `null`.
    Null,

    // === Identifiers and keywords ===
    Identifier(String),
    /// `this`.
    This,
    /// `$locals`.
    Locals,

    // === Punctuation ===
    LeftBracket,
    RightBracket,
    LeftBrace,
    RightBrace,
    LeftParen,
    RightParen,
    Colon,
    Comma,
    Dot,
    Question,
    Semicolon,

    // === Operators ===
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Bang,
    Assign,
    Eq,
    NotEq,
    StrictEq,
    StrictNotEq,
    Lt,
    Gt,
    Le,
    Ge,
    And,
    Or,
    Pipe,

    Eof,
}

impl TokenKind {
    pub fn describe(&self) -> &'static str {
        match self {
            TokenKind::Number(_) => "number",
            TokenKind::String(_) => "string",
            TokenKind::Bool(_) => "boolean",
            TokenKind::Null => "null",
            TokenKind::Identifier(_) => "identifier",
            TokenKind::This => "this",
            TokenKind::Locals => "$locals",
            TokenKind::LeftBracket => "[",
            TokenKind::RightBracket => "]",
            TokenKind::LeftBrace => "{",
            TokenKind::RightBrace => "}",
            TokenKind::LeftParen => "(",
            TokenKind::RightParen => ")",
            TokenKind::Colon => ":",
            TokenKind::Comma => ",",
            TokenKind::Dot => ".",
            TokenKind::Question => "?",
            TokenKind::Semicolon => ";",
            TokenKind::Plus => "+",
            TokenKind::Minus => "-",
            TokenKind::Star => "*",
            TokenKind::Slash => "/",
            TokenKind::Percent => "%",
            TokenKind::Bang => "!",
            TokenKind::Assign => "=",
            TokenKind::Eq => "==",
            TokenKind::NotEq => "!=",
            TokenKind::StrictEq => "===",
            TokenKind::StrictNotEq => "!==",
            TokenKind::Lt => "<",
            TokenKind::Gt => ">",
            TokenKind::Le => "<=",
            TokenKind::Ge => ">=",
            TokenKind::And => "&&",
            TokenKind::Or => "||",
            TokenKind::Pipe => "|",
            TokenKind::Eof => "<eof>",
        }
    }
}

/// A single lexed token: its kind, source text, and span.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub span: Span,
}

impl Token {
    /// The literal value a `Literal` AST node should carry, if this token
    /// is itself a constant (spec §3 `Token { value? }`).
    pub fn literal_value(&self) -> Option<Value> {
        match &self.kind {
            TokenKind::Number(n) => Some(Value::Number(*n)),
            TokenKind::String(s) => Some(Value::string(s.as_str())),
            TokenKind::Bool(b) => Some(Value::Bool(*b)),
            TokenKind::Null => Some(Value::Null),
            _ => None,
        }
    }

    pub fn is_identifier(&self) -> bool {
        matches!(self.kind, TokenKind::Identifier(_))
    }
}

fn is_identifier_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == '$'
}

fn is_identifier_part(c: char) -> bool {
    is_identifier_start(c) || c.is_ascii_digit()
}

fn is_whitespace(c: char) -> bool {
    matches!(c, ' ' | '\t' | '\n' | '\r' | '\u{000B}' | '\u{00A0}')
}

/// Converts program text into a finite sequence of tokens.
pub struct Lexer<'a> {
    source: &'a str,
    chars: Peekable<CharIndices<'a>>,
    line: usize,
    column: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str) -> Self {
        Self {
            source,
            chars: source.char_indices().peekable(),
            line: 1,
            column: 1,
        }
    }

    /// Lexes the entire source, appending a trailing `Eof` token.
    pub fn tokenize(mut self) -> Result<Vec<Token>, LexError> {
        let mut tokens = Vec::new();
        loop {
            let tok = self.next_token()?;
            let done = tok.kind == TokenKind::Eof;
            tokens.push(tok);
            if done {
                break;
            }
        }
        Ok(tokens)
    }

    fn span_here(&mut self, start: usize, start_line: usize, start_col: usize) -> Span {
        let end = self.chars.peek().map(|(i, _)| *i).unwrap_or(self.source.len());
        Span::new(start, end, start_line, start_col)
    }

    fn advance(&mut self) -> Option<(usize, char)> {
        let item = self.chars.next();
        if let Some((_, c)) = item {
            if c == '\n' {
                self.line += 1;
                self.column = 1;
            } else {
                self.column += 1;
            }
        }
        item
    }

    fn peek_char(&mut self) -> Option<char> {
        self.chars.peek().map(|(_, c)| *c)
    }

    fn peek_nth(&self, n: usize) -> Option<char> {
        self.chars.clone().nth(n).map(|(_, c)| c)
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek_char() {
            if is_whitespace(c) {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn next_token(&mut self) -> Result<Token, LexError> {
        self.skip_whitespace();
        let start_line = self.line;
        let start_col = self.column;
        let start = self.chars.peek().map(|(i, _)| *i).unwrap_or(self.source.len());

        let Some(c) = self.peek_char() else {
            return Ok(Token {
                kind: TokenKind::Eof,
                text: String::new(),
                span: Span::new(start, start, start_line, start_col),
            });
        };

        if c.is_ascii_digit() || (c == '.' && self.peek_nth(1).is_some_and(|n| n.is_ascii_digit())) {
            return self.lex_number(start, start_line, start_col);
        }
        if c == '\'' || c == '"' {
            return self.lex_string(c, start, start_line, start_col);
        }
        if is_identifier_start(c) {
            return self.lex_identifier(start, start_line, start_col);
        }

        self.lex_operator(c, start, start_line, start_col)
    }

    fn lex_number(&mut self, start: usize, line: usize, col: usize) -> Result<Token, LexError> {
        let mut text = String::new();
        while let Some(c) = self.peek_char() {
            if c.is_ascii_digit() {
                text.push(c);
                self.advance();
            } else {
                break;
            }
        }
        if self.peek_char() == Some('.') && self.peek_nth(1).is_some_and(|n| n.is_ascii_digit()) {
            text.push('.');
            self.advance();
            while let Some(c) = self.peek_char() {
                if c.is_ascii_digit() {
                    text.push(c);
                    self.advance();
                } else {
                    break;
                }
            }
        }
        if matches!(self.peek_char(), Some('e') | Some('E')) {
            let mut exponent = String::new();
            exponent.push(self.advance().unwrap().1);
            if matches!(self.peek_char(), Some('+') | Some('-')) {
                exponent.push(self.advance().unwrap().1);
            }
            let mut has_digits = false;
            while let Some(c) = self.peek_char() {
                if c.is_ascii_digit() {
                    exponent.push(c);
                    has_digits = true;
                    self.advance();
                } else {
                    break;
                }
            }
            if !has_digits {
                let span = self.span_here(start, line, col);
                return Err(LexError::InvalidNumber { text: text + &exponent, span });
            }
            text.push_str(&exponent);
        }

        let span = self.span_here(start, line, col);
        match text.parse::<f64>() {
            Ok(n) => Ok(Token { kind: TokenKind::Number(n), text, span }),
            Err(_) => Err(LexError::InvalidNumber { text, span }),
        }
    }

    fn lex_string(&mut self, quote: char, start: usize, line: usize, col: usize) -> Result<Token, LexError> {
        self.advance(); // opening quote
        let mut value = String::new();
        let mut raw = String::from(quote);
        loop {
            let Some(c) = self.peek_char() else {
                let span = self.span_here(start, line, col);
                return Err(LexError::UnterminatedString { span });
            };
            if c == quote {
                raw.push(c);
                self.advance();
                break;
            }
            if c == '\\' {
                raw.push(c);
                self.advance();
                let Some(escaped) = self.peek_char() else {
                    let span = self.span_here(start, line, col);
                    return Err(LexError::UnterminatedString { span });
                };
                raw.push(escaped);
                self.advance();
                match escaped {
                    'n' => value.push('\n'),
                    'f' => value.push('\u{000C}'),
                    'r' => value.push('\r'),
                    't' => value.push('\t'),
                    'v' => value.push('\u{000B}'),
                    '\'' => value.push('\''),
                    '"' => value.push('"'),
                    '\\' => value.push('\\'),
                    'u' => {
                        let mut hex = String::with_capacity(4);
                        for _ in 0..4 {
                            let Some(h) = self.peek_char() else {
                                let span = self.span_here(start, line, col);
                                return Err(LexError::InvalidUnicodeEscape { span });
                            };
                            if !h.is_ascii_hexdigit() {
                                let span = self.span_here(start, line, col);
                                return Err(LexError::InvalidUnicodeEscape { span });
                            }
                            hex.push(h);
                            raw.push(h);
                            self.advance();
                        }
                        let code = u32::from_str_radix(&hex, 16).ok();
                        match code.and_then(char::from_u32) {
                            Some(ch) => value.push(ch),
                            None => {
                                let span = self.span_here(start, line, col);
                                return Err(LexError::InvalidUnicodeEscape { span });
                            }
                        }
                    }
                    other => {
                        let span = self.span_here(start, line, col);
                        return Err(LexError::InvalidEscape { ch: other, span });
                    }
                }
                continue;
            }
            value.push(c);
            raw.push(c);
            self.advance();
        }
        let span = self.span_here(start, line, col);
        Ok(Token { kind: TokenKind::String(value), text: raw, span })
    }

    fn lex_identifier(&mut self, start: usize, line: usize, col: usize) -> Result<Token, LexError> {
        let mut text = String::new();
        while let Some(c) = self.peek_char() {
            if is_identifier_part(c) {
                text.push(c);
                self.advance();
            } else {
                break;
            }
        }
        let span = self.span_here(start, line, col);
        let kind = match text.as_str() {
            "true" => TokenKind::Bool(true),
            "false" => TokenKind::Bool(false),
            "null" => TokenKind::Null,
            "this" => TokenKind::This,
            "$locals" => TokenKind::Locals,
            _ => TokenKind::Identifier(text.clone()),
        };
        Ok(Token { kind, text, span })
    }

    fn lex_operator(&mut self, c: char, start: usize, line: usize, col: usize) -> Result<Token, LexError> {
        let (kind, len) = match c {
            '[' => (TokenKind::LeftBracket, 1),
            ']' => (TokenKind::RightBracket, 1),
            '{' => (TokenKind::LeftBrace, 1),
            '}' => (TokenKind::RightBrace, 1),
            '(' => (TokenKind::LeftParen, 1),
            ')' => (TokenKind::RightParen, 1),
            ':' => (TokenKind::Colon, 1),
            ',' => (TokenKind::Comma, 1),
            '.' => (TokenKind::Dot, 1),
            '?' => (TokenKind::Question, 1),
            ';' => (TokenKind::Semicolon, 1),
            '+' => (TokenKind::Plus, 1),
            '-' => (TokenKind::Minus, 1),
            '*' => (TokenKind::Star, 1),
            '/' => (TokenKind::Slash, 1),
            '%' => (TokenKind::Percent, 1),
            '|' => {
                if self.peek_nth(1) == Some('|') {
                    (TokenKind::Or, 2)
                } else {
                    (TokenKind::Pipe, 1)
                }
            }
            '&' if self.peek_nth(1) == Some('&') => (TokenKind::And, 2),
            '=' => match (self.peek_nth(1), self.peek_nth(2)) {
                (Some('='), Some('=')) => (TokenKind::StrictEq, 3),
                (Some('='), _) => (TokenKind::Eq, 2),
                _ => (TokenKind::Assign, 1),
            },
            '!' => match (self.peek_nth(1), self.peek_nth(2)) {
                (Some('='), Some('=')) => (TokenKind::StrictNotEq, 3),
                (Some('='), _) => (TokenKind::NotEq, 2),
                _ => (TokenKind::Bang, 1),
            },
            '<' => {
                if self.peek_nth(1) == Some('=') {
                    (TokenKind::Le, 2)
                } else {
                    (TokenKind::Lt, 1)
                }
            }
            '>' => {
                if self.peek_nth(1) == Some('=') {
                    (TokenKind::Ge, 2)
                } else {
                    (TokenKind::Gt, 1)
                }
            }
            other => {
                let span = self.span_here(start, line, col);
                return Err(LexError::UnexpectedChar { ch: other, span });
            }
        };

        let mut text = String::new();
        for _ in 0..len {
            text.push(self.advance().unwrap().1);
        }
        let span = self.span_here(start, line, col);
        Ok(Token { kind, text, span })
    }
}

pub fn tokenize(source: &str) -> Result<Vec<Token>, LexError> {
    Lexer::new(source).tokenize()
}
