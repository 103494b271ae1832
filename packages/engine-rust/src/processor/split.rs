//! Splitter: breaks a body into parts, routes each part through nested
//! steps, and optionally folds the results back together.

use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use switchyard_core::{keys, Exchange, Expression, Value};

use super::strategy::apply_result;
use super::{AggregationStrategy, Pipeline, Processor};

/// A lazily produced sequence of part bodies.
pub type Parts = Box<dyn Iterator<Item = Value> + Send>;

type SplitFn = Arc<dyn Fn(&Exchange) -> anyhow::Result<Parts> + Send + Sync>;

/// How the body is broken into parts.
///
/// Null bodies, empty text, and empty lists yield no parts.
#[derive(Clone)]
pub enum Splitter {
    /// List items; any other non-null body is a single part.
    Body,
    /// Text split on a separator token.
    Tokenize(String),
    /// Text split into lines, without line terminators.
    Lines,
    /// Parts of whatever the expression evaluates to, as for `Body`.
    Expression(Expression),
    Custom(SplitFn),
}

impl Splitter {
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&Exchange) -> anyhow::Result<Parts> + Send + Sync + 'static,
    {
        Splitter::Custom(Arc::new(f))
    }

    fn parts(&self, exchange: &Exchange) -> anyhow::Result<Parts> {
        match self {
            Splitter::Body => Ok(value_parts(exchange.body().clone())),
            Splitter::Expression(expression) => Ok(value_parts(expression.evaluate(exchange)?)),
            Splitter::Tokenize(token) => Ok(Box::new(Tokens::new(body_text(exchange)?, token, false))),
            Splitter::Lines => Ok(Box::new(Tokens::new(body_text(exchange)?, "\n", true))),
            Splitter::Custom(f) => f(exchange),
        }
    }
}

fn value_parts(value: Value) -> Parts {
    match value {
        Value::Null => Box::new(std::iter::empty()),
        Value::List(items) => Box::new(items.into_iter()),
        Value::Text(text) if text.is_empty() => Box::new(std::iter::empty()),
        other => Box::new(std::iter::once(other)),
    }
}

fn body_text(exchange: &Exchange) -> anyhow::Result<String> {
    Ok(exchange
        .body_as::<String>()
        .context("split body is not text")?
        .unwrap_or_default())
}

/// Token iterator over an owned string.
struct Tokens {
    text: String,
    token: String,
    pos: usize,
    lines: bool,
    done: bool,
}

impl Tokens {
    fn new(text: String, token: &str, lines: bool) -> Self {
        let done = text.is_empty();
        Self {
            text,
            token: token.to_string(),
            pos: 0,
            lines,
            done,
        }
    }

    fn part(&self, raw: &str) -> Value {
        let part = if self.lines {
            raw.strip_suffix('\r').unwrap_or(raw)
        } else {
            raw
        };
        Value::Text(part.to_string())
    }
}

impl Iterator for Tokens {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        if self.done {
            return None;
        }
        let rest = &self.text[self.pos..];
        if !self.token.is_empty() {
            if let Some(offset) = rest.find(self.token.as_str()) {
                let part = self.part(&rest[..offset]);
                self.pos += offset + self.token.len();
                return Some(part);
            }
        }
        self.done = true;
        // A trailing newline does not start another line.
        if self.lines && rest.is_empty() {
            return None;
        }
        Some(self.part(rest))
    }
}

// ---------------------------------------------------------------------------
// Split
// ---------------------------------------------------------------------------

/// Routes each part as its own exchange.
///
/// Parts carry [`keys::SPLIT_INDEX`] and [`keys::SPLIT_COMPLETE`]. With a
/// strategy the folded result replaces the message; without one the original
/// exchange continues. The first failed part fails the step.
pub struct Split {
    splitter: Splitter,
    steps: Pipeline,
    strategy: Option<Arc<dyn AggregationStrategy>>,
    parallel: Option<usize>,
    ordered: bool,
    stop_on_exception: bool,
}

impl Split {
    #[must_use]
    pub fn new(splitter: Splitter, steps: Pipeline) -> Self {
        Self {
            splitter,
            steps,
            strategy: None,
            parallel: None,
            ordered: false,
            stop_on_exception: false,
        }
    }

    #[must_use]
    pub fn strategy(mut self, strategy: Arc<dyn AggregationStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Processes up to `limit` parts concurrently, folding in completion
    /// order unless `ordered` is set.
    #[must_use]
    pub fn parallel(mut self, limit: usize, ordered: bool) -> Self {
        self.parallel = Some(limit.max(1));
        self.ordered = ordered;
        self
    }

    #[must_use]
    pub fn stop_on_exception(mut self, stop: bool) -> Self {
        self.stop_on_exception = stop;
        self
    }

    fn sub_exchanges<'a>(
        &'a self,
        exchange: &'a Exchange,
        parts: Parts,
    ) -> BoxStream<'a, Exchange> {
        let mut parts = parts.peekable();
        let tagged = std::iter::from_fn(move || {
            let body = parts.next()?;
            Some((body, parts.peek().is_none()))
        });
        let runs = tagged.enumerate().map(move |(index, (body, last))| {
            let mut sub = exchange.copy_with_body(body);
            sub.set_property(keys::SPLIT_INDEX, i64::try_from(index).unwrap_or(i64::MAX));
            sub.set_property(keys::SPLIT_COMPLETE, last);
            let steps = self.steps.clone();
            async move {
                steps.run(&mut sub).await;
                sub
            }
        });
        match self.parallel {
            None => stream::iter(runs).buffered(1).boxed(),
            Some(limit) if self.ordered => stream::iter(runs).buffered(limit).boxed(),
            Some(limit) => stream::iter(runs).buffer_unordered(limit).boxed(),
        }
    }
}

#[async_trait]
impl Processor for Split {
    fn name(&self) -> &str {
        "split"
    }

    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        let parts = self.splitter.parts(exchange)?;

        let mut processed: i64 = 0;
        let mut folded: Option<Exchange> = None;
        let mut first_failure = None;
        {
            let mut results = self.sub_exchanges(exchange, parts);
            while let Some(mut sub) = results.next().await {
                processed += 1;
                if let Some(failure) = sub.take_failure() {
                    first_failure.get_or_insert(failure);
                    if self.stop_on_exception {
                        break;
                    }
                    continue;
                }
                if let Some(strategy) = &self.strategy {
                    folded = Some(strategy.aggregate(folded.take(), sub));
                }
            }
        }

        if processed == 0 {
            return Ok(());
        }
        if let Some(result) = folded {
            apply_result(exchange, result);
            exchange.remove_property(keys::SPLIT_INDEX);
            exchange.remove_property(keys::SPLIT_COMPLETE);
        }
        exchange.set_property(keys::SPLIT_SIZE, processed);
        match first_failure {
            Some(failure) => Err(anyhow::Error::new(failure)),
            None => Ok(()),
        }
    }

    async fn start(&self) -> anyhow::Result<()> {
        self.steps.start().await
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.steps.stop().await;
        Ok(())
    }
}
