//! Expressions and predicates evaluated against an exchange.
//!
//! Besides constants, body/header/property access, and closures, a small
//! template language is supported: `${body}`, `${header.name}`,
//! `${exchangeProperty.name}`, `${exchangeId}`, and `${routeId}`.

use std::fmt;
use std::sync::{Arc, LazyLock};

use regex::Regex;

use crate::exchange::Exchange;
use crate::value::Value;

static TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}]*)\}").expect("token pattern is valid"));

/// Errors raised while evaluating an expression.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExpressionError {
    #[error("unknown template token `${{{0}}}`")]
    UnknownToken(String),
}

// ---------------------------------------------------------------------------
// Template
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Body,
    Header(String),
    Property(String),
    ExchangeId,
    RouteId,
    Unknown(String),
}

impl Token {
    fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        match raw {
            "body" | "in.body" => Token::Body,
            "exchangeId" => Token::ExchangeId,
            "routeId" => Token::RouteId,
            _ => {
                if let Some(name) = raw
                    .strip_prefix("header.")
                    .or_else(|| raw.strip_prefix("headers."))
                {
                    Token::Header(name.to_string())
                } else if let Some(name) = raw.strip_prefix("exchangeProperty.") {
                    Token::Property(name.to_string())
                } else {
                    Token::Unknown(raw.to_string())
                }
            }
        }
    }

    fn evaluate(&self, exchange: &Exchange) -> Result<Value, ExpressionError> {
        Ok(match self {
            Token::Body => exchange.body().clone(),
            Token::Header(name) => exchange.header(name).cloned().unwrap_or_default(),
            Token::Property(name) => exchange.property(name).cloned().unwrap_or_default(),
            Token::ExchangeId => Value::from(exchange.id()),
            Token::RouteId => exchange.route_id().map(Value::from).unwrap_or_default(),
            Token::Unknown(name) => return Err(ExpressionError::UnknownToken(name.clone())),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Token(Token),
}

/// A parsed `${...}` template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
}

impl Template {
    /// Parses `source`. Unknown tokens are reported when evaluated.
    #[must_use]
    pub fn parse(source: &str) -> Self {
        let mut segments = Vec::new();
        let mut last = 0;
        for caps in TOKEN.captures_iter(source) {
            let (Some(whole), Some(inner)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            if whole.start() > last {
                segments.push(Segment::Literal(source[last..whole.start()].to_string()));
            }
            segments.push(Segment::Token(Token::parse(inner.as_str())));
            last = whole.end();
        }
        if last < source.len() {
            segments.push(Segment::Literal(source[last..].to_string()));
        }
        Self {
            source: source.to_string(),
            segments,
        }
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluates the template.
    ///
    /// A template consisting of a single token yields that token's value
    /// unchanged; anything else renders to text.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown tokens or values that cannot be rendered
    /// as text.
    pub fn evaluate(&self, exchange: &Exchange) -> anyhow::Result<Value> {
        if let [Segment::Token(token)] = self.segments.as_slice() {
            return Ok(token.evaluate(exchange)?);
        }
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Token(token) => {
                    let value = token.evaluate(exchange)?;
                    if let Some(text) = exchange.converters().convert_to::<String>(&value)? {
                        out.push_str(&text);
                    }
                }
            }
        }
        Ok(Value::Text(out))
    }
}

// ---------------------------------------------------------------------------
// Expression
// ---------------------------------------------------------------------------

/// A closure computing a value from an exchange.
pub type ExpressionFn = Arc<dyn Fn(&Exchange) -> anyhow::Result<Value> + Send + Sync>;

/// A value computed from an exchange.
#[derive(Clone)]
pub enum Expression {
    Constant(Value),
    Body,
    Header(String),
    Property(String),
    ExchangeId,
    Template(Template),
    Fn(ExpressionFn),
}

impl Expression {
    pub fn constant(value: impl Into<Value>) -> Self {
        Expression::Constant(value.into())
    }

    #[must_use]
    pub fn body() -> Self {
        Expression::Body
    }

    pub fn header(name: impl Into<String>) -> Self {
        Expression::Header(name.into())
    }

    pub fn property(name: impl Into<String>) -> Self {
        Expression::Property(name.into())
    }

    /// A `${...}` template expression.
    #[must_use]
    pub fn simple(template: &str) -> Self {
        Expression::Template(Template::parse(template))
    }

    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&Exchange) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        Expression::Fn(Arc::new(f))
    }

    /// Evaluates against `exchange`. Missing headers and properties yield `Null`.
    ///
    /// # Errors
    ///
    /// Propagates template and closure errors.
    pub fn evaluate(&self, exchange: &Exchange) -> anyhow::Result<Value> {
        match self {
            Expression::Constant(value) => Ok(value.clone()),
            Expression::Body => Ok(exchange.body().clone()),
            Expression::Header(name) => Ok(exchange.header(name).cloned().unwrap_or_default()),
            Expression::Property(name) => {
                Ok(exchange.property(name).cloned().unwrap_or_default())
            }
            Expression::ExchangeId => Ok(Value::from(exchange.id())),
            Expression::Template(template) => template.evaluate(exchange),
            Expression::Fn(f) => f(exchange),
        }
    }
}

impl fmt::Debug for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::Constant(v) => write!(f, "constant({v})"),
            Expression::Body => f.write_str("body"),
            Expression::Header(name) => write!(f, "header({name})"),
            Expression::Property(name) => write!(f, "property({name})"),
            Expression::ExchangeId => f.write_str("exchangeId"),
            Expression::Template(t) => write!(f, "simple({})", t.source()),
            Expression::Fn(_) => f.write_str("fn"),
        }
    }
}

impl From<Value> for Expression {
    fn from(value: Value) -> Self {
        Expression::Constant(value)
    }
}

impl From<&str> for Expression {
    /// String literals are templates, so `"Hello ${body}"` works directly.
    fn from(value: &str) -> Self {
        Expression::simple(value)
    }
}

// ---------------------------------------------------------------------------
// Predicate
// ---------------------------------------------------------------------------

type PredicateFn = Arc<dyn Fn(&Exchange) -> bool + Send + Sync>;

/// A boolean test over an exchange.
#[derive(Clone)]
pub struct Predicate(PredicateFn);

impl Predicate {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Exchange) -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    #[must_use]
    pub fn matches(&self, exchange: &Exchange) -> bool {
        (self.0)(exchange)
    }

    #[must_use]
    pub fn constant(result: bool) -> Self {
        Self::new(move |_| result)
    }

    pub fn has_header(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(move |ex| ex.header(&name).is_some_and(|v| !v.is_null()))
    }

    /// Header equals `expected`, converting the header to the expected type first.
    pub fn header_equals(name: impl Into<String>, expected: impl Into<Value>) -> Self {
        let name = name.into();
        let expected = expected.into();
        Self::new(move |ex| {
            ex.header(&name).is_some_and(|actual| {
                ex.converters()
                    .convert(actual, expected.type_key())
                    .is_ok_and(|converted| converted == expected)
            })
        })
    }

    pub fn property_equals(name: impl Into<String>, expected: impl Into<Value>) -> Self {
        let name = name.into();
        let expected = expected.into();
        Self::new(move |ex| ex.property(&name) == Some(&expected))
    }

    /// Body, read as text, contains `needle`.
    pub fn body_contains(needle: impl Into<String>) -> Self {
        let needle = needle.into();
        Self::new(move |ex| {
            ex.body_as::<String>()
                .ok()
                .flatten()
                .is_some_and(|body| body.contains(&needle))
        })
    }

    pub fn body_equals(expected: impl Into<Value>) -> Self {
        let expected = expected.into();
        Self::new(move |ex| {
            ex.converters()
                .convert(ex.body(), expected.type_key())
                .is_ok_and(|converted| converted == expected)
        })
    }

    #[must_use]
    pub fn negate(self) -> Self {
        Self::new(move |ex| !self.matches(ex))
    }

    #[must_use]
    pub fn and(self, other: Predicate) -> Self {
        Self::new(move |ex| self.matches(ex) && other.matches(ex))
    }

    #[must_use]
    pub fn or(self, other: Predicate) -> Self {
        Self::new(move |ex| self.matches(ex) || other.matches(ex))
    }
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Predicate")
    }
}
