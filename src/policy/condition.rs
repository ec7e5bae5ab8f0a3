//! Boolean condition language for policy allow-exceptions.
//!
//! ```text
//! expr    := and ("||" and)*
//! and     := unary ("&&" unary)*
//! unary   := "!" unary | primary
//! primary := "(" expr ")" | "true" | "false"
//!          | ident [("==" | "!=" | "starts_with" | "contains") string]
//! ```
//!
//! A bare identifier is a fact test (see [`ActionContext::truthy`]).

use super::context::ActionContext;
use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    StartsWith,
    Contains,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    Literal(bool),
    Fact(String),
    Compare {
        field: String,
        op: CompareOp,
        value: String,
    },
    Not(Box<Condition>),
    All(Vec<Condition>),
    Any(Vec<Condition>),
}

impl Condition {
    pub fn parse(source: &str) -> Result<Self, ConfigError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            source,
            tokens,
            pos: 0,
        };
        let condition = parser.expr()?;
        if let Some(token) = parser.tokens.get(parser.pos) {
            return Err(parser.error(token.offset, "unexpected trailing input"));
        }
        Ok(condition)
    }

    pub fn evaluate(&self, ctx: &ActionContext) -> bool {
        match self {
            Self::Literal(value) => *value,
            Self::Fact(name) => ctx.truthy(name),
            Self::Compare { field, op, value } => {
                let actual = ctx.text(field);
                match op {
                    CompareOp::Eq => actual == value.as_str(),
                    CompareOp::Ne => actual != value.as_str(),
                    CompareOp::StartsWith => actual.starts_with(value.as_str()),
                    CompareOp::Contains => actual.contains(value.as_str()),
                }
            }
            Self::Not(inner) => !inner.evaluate(ctx),
            Self::All(items) => items.iter().all(|c| c.evaluate(ctx)),
            Self::Any(items) => items.iter().any(|c| c.evaluate(ctx)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Tok {
    LParen,
    RParen,
    Not,
    And,
    Or,
    Eq,
    Ne,
    Ident(String),
    Str(String),
}

#[derive(Debug, Clone)]
struct Token {
    tok: Tok,
    offset: usize,
}

fn tokenize(source: &str) -> Result<Vec<Token>, ConfigError> {
    let err = |offset: usize, message: &str| ConfigError::Condition {
        source_text: source.to_string(),
        offset,
        message: message.to_string(),
    };

    let mut tokens = Vec::new();
    let mut chars = source.char_indices().peekable();
    while let Some((offset, c)) = chars.next() {
        let tok = match c {
            c if c.is_whitespace() => continue,
            '(' => Tok::LParen,
            ')' => Tok::RParen,
            '!' if chars.peek().is_some_and(|(_, n)| *n == '=') => {
                chars.next();
                Tok::Ne
            }
            '!' => Tok::Not,
            '&' if chars.next_if(|(_, n)| *n == '&').is_some() => Tok::And,
            '|' if chars.next_if(|(_, n)| *n == '|').is_some() => Tok::Or,
            '=' if chars.next_if(|(_, n)| *n == '=').is_some() => Tok::Eq,
            '"' => {
                let mut value = String::new();
                let mut closed = false;
                while let Some((_, ch)) = chars.next() {
                    match ch {
                        '"' => {
                            closed = true;
                            break;
                        }
                        '\\' => match chars.next() {
                            Some((_, escaped)) => value.push(escaped),
                            None => break,
                        },
                        other => value.push(other),
                    }
                }
                if !closed {
                    return Err(err(offset, "unterminated string"));
                }
                Tok::Str(value)
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::from(c);
                while let Some((_, n)) =
                    chars.next_if(|(_, n)| n.is_ascii_alphanumeric() || *n == '_' || *n == '.')
                {
                    ident.push(n);
                }
                Tok::Ident(ident)
            }
            _ => return Err(err(offset, &format!("unexpected character `{c}`"))),
        };
        tokens.push(Token { tok, offset });
    }
    Ok(tokens)
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser<'_> {
    fn error(&self, offset: usize, message: &str) -> ConfigError {
        ConfigError::Condition {
            source_text: self.source.to_string(),
            offset,
            message: message.to_string(),
        }
    }

    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos).map(|t| &t.tok)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn end_offset(&self) -> usize {
        self.source.len()
    }

    fn expr(&mut self) -> Result<Condition, ConfigError> {
        let mut items = vec![self.and()?];
        while self.peek() == Some(&Tok::Or) {
            self.advance();
            items.push(self.and()?);
        }
        Ok(collapse(items, Condition::Any))
    }

    fn and(&mut self) -> Result<Condition, ConfigError> {
        let mut items = vec![self.unary()?];
        while self.peek() == Some(&Tok::And) {
            self.advance();
            items.push(self.unary()?);
        }
        Ok(collapse(items, Condition::All))
    }

    fn unary(&mut self) -> Result<Condition, ConfigError> {
        if self.peek() == Some(&Tok::Not) {
            self.advance();
            return Ok(Condition::Not(Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Condition, ConfigError> {
        let Some(token) = self.advance() else {
            return Err(self.error(self.end_offset(), "expected operand"));
        };
        match token.tok {
            Tok::LParen => {
                let inner = self.expr()?;
                match self.advance() {
                    Some(Token {
                        tok: Tok::RParen, ..
                    }) => Ok(inner),
                    Some(other) => Err(self.error(other.offset, "expected `)`")),
                    None => Err(self.error(self.end_offset(), "expected `)`")),
                }
            }
            Tok::Ident(name) if name == "true" => Ok(Condition::Literal(true)),
            Tok::Ident(name) if name == "false" => Ok(Condition::Literal(false)),
            Tok::Ident(field) => {
                let op = match self.peek() {
                    Some(Tok::Eq) => CompareOp::Eq,
                    Some(Tok::Ne) => CompareOp::Ne,
                    Some(Tok::Ident(word)) if word == "starts_with" => CompareOp::StartsWith,
                    Some(Tok::Ident(word)) if word == "contains" => CompareOp::Contains,
                    _ => return Ok(Condition::Fact(field)),
                };
                self.advance();
                match self.advance() {
                    Some(Token {
                        tok: Tok::Str(value),
                        ..
                    }) => Ok(Condition::Compare { field, op, value }),
                    Some(other) => Err(self.error(other.offset, "expected string literal")),
                    None => Err(self.error(self.end_offset(), "expected string literal")),
                }
            }
            _ => Err(self.error(token.offset, "expected operand")),
        }
    }
}

fn collapse(mut items: Vec<Condition>, wrap: fn(Vec<Condition>) -> Condition) -> Condition {
    if items.len() == 1 {
        items.remove(0)
    } else {
        wrap(items)
    }
}
