//! Control-flow steps: filter, choice, loop, and try/catch/finally.

use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use switchyard_core::{keys, Exchange, ExchangeFailure, Expression, Predicate};

use super::{Pipeline, Processor};

// ---------------------------------------------------------------------------
// Filter / Choice
// ---------------------------------------------------------------------------

/// Runs the nested steps only when the predicate matches.
pub struct Filter {
    predicate: Predicate,
    steps: Pipeline,
}

impl Filter {
    #[must_use]
    pub fn new(predicate: Predicate, steps: Pipeline) -> Self {
        Self { predicate, steps }
    }
}

#[async_trait]
impl Processor for Filter {
    fn name(&self) -> &str {
        "filter"
    }

    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        if self.predicate.matches(exchange) {
            self.steps.run(exchange).await;
        }
        Ok(())
    }

    async fn start(&self) -> anyhow::Result<()> {
        self.steps.start().await
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.steps.stop().await;
        Ok(())
    }
}

/// Content-based router: the first matching `when` runs, else `otherwise`.
pub struct Choice {
    whens: Vec<(Predicate, Pipeline)>,
    otherwise: Option<Pipeline>,
}

impl Choice {
    #[must_use]
    pub fn new(whens: Vec<(Predicate, Pipeline)>, otherwise: Option<Pipeline>) -> Self {
        Self { whens, otherwise }
    }

    fn branches(&self) -> impl Iterator<Item = &Pipeline> {
        self.whens
            .iter()
            .map(|(_, pipeline)| pipeline)
            .chain(self.otherwise.iter())
    }
}

#[async_trait]
impl Processor for Choice {
    fn name(&self) -> &str {
        "choice"
    }

    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        let branch = self
            .whens
            .iter()
            .find(|(predicate, _)| predicate.matches(exchange))
            .map(|(_, pipeline)| pipeline)
            .or(self.otherwise.as_ref());
        if let Some(branch) = branch {
            branch.run(exchange).await;
        }
        Ok(())
    }

    async fn start(&self) -> anyhow::Result<()> {
        for branch in self.branches() {
            branch.start().await?;
        }
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        for branch in self.branches() {
            branch.stop().await;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Loop
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub enum LoopMode {
    /// Evaluate the expression once and iterate that many times.
    Count(Expression),
    /// Iterate while the predicate holds, checked before each iteration.
    While(Predicate),
}

/// Runs the nested steps repeatedly on the same exchange, setting
/// [`keys::LOOP_INDEX`].
pub struct Loop {
    mode: LoopMode,
    steps: Pipeline,
}

impl Loop {
    #[must_use]
    pub fn new(mode: LoopMode, steps: Pipeline) -> Self {
        Self { mode, steps }
    }
}

#[async_trait]
impl Processor for Loop {
    fn name(&self) -> &str {
        "loop"
    }

    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        let limit = match &self.mode {
            LoopMode::Count(expression) => {
                let value = expression.evaluate(exchange)?;
                let count = exchange
                    .converters()
                    .convert_to::<i64>(&value)?
                    .context("loop count evaluated to null")?;
                Some(count.max(0))
            }
            LoopMode::While(_) => None,
        };

        let mut index: i64 = 0;
        loop {
            let more = match (&self.mode, limit) {
                (_, Some(limit)) => index < limit,
                (LoopMode::While(predicate), None) => predicate.matches(exchange),
                (LoopMode::Count(_), None) => false,
            };
            if !more || exchange.is_failed() || exchange.is_stopped() {
                break;
            }
            exchange.set_property(keys::LOOP_INDEX, index);
            self.steps.run(exchange).await;
            index += 1;
        }
        Ok(())
    }

    async fn start(&self) -> anyhow::Result<()> {
        self.steps.start().await
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.steps.stop().await;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// DoTry
// ---------------------------------------------------------------------------

type FailureMatcher = Arc<dyn Fn(&ExchangeFailure) -> bool + Send + Sync>;

/// Selects which failures a catch block handles.
#[derive(Clone)]
pub struct Catch(FailureMatcher);

impl Catch {
    /// Failures whose cause chain contains an `E`.
    #[must_use]
    pub fn error<E>() -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self(Arc::new(|failure| failure.is::<E>()))
    }

    /// Every failure.
    #[must_use]
    pub fn any() -> Self {
        Self(Arc::new(|_| true))
    }

    /// Failures whose rendered cause contains `needle`.
    pub fn message_contains(needle: impl Into<String>) -> Self {
        let needle = needle.into();
        Self(Arc::new(move |failure| {
            format!("{:#}", failure.cause()).contains(&needle)
        }))
    }

    pub fn when<F>(f: F) -> Self
    where
        F: Fn(&ExchangeFailure) -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    #[must_use]
    pub fn matches(&self, failure: &ExchangeFailure) -> bool {
        (self.0)(failure)
    }
}

/// `try { .. } catch (..) { .. } finally { .. }` over nested steps.
///
/// A handled failure is cleared and described in [`keys::EXCEPTION_CAUGHT`]
/// and [`keys::FAILURE_STEP`]. The finally block always runs; an unhandled
/// failure is restored afterwards unless the finally block failed itself.
pub struct DoTry {
    body: Pipeline,
    catches: Vec<(Catch, Pipeline)>,
    finally: Option<Pipeline>,
}

impl DoTry {
    #[must_use]
    pub fn new(body: Pipeline, catches: Vec<(Catch, Pipeline)>, finally: Option<Pipeline>) -> Self {
        Self {
            body,
            catches,
            finally,
        }
    }

    fn blocks(&self) -> impl Iterator<Item = &Pipeline> {
        std::iter::once(&self.body)
            .chain(self.catches.iter().map(|(_, p)| p))
            .chain(self.finally.iter())
    }
}

#[async_trait]
impl Processor for DoTry {
    fn name(&self) -> &str {
        "doTry"
    }

    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        self.body.run(exchange).await;

        if let Some(failure) = exchange.failure().cloned() {
            let handler = self
                .catches
                .iter()
                .find(|(catch, _)| catch.matches(&failure))
                .map(|(_, pipeline)| pipeline);
            if let Some(handler) = handler {
                tracing::debug!(
                    exchange_id = exchange.id(),
                    step = failure.step(),
                    "failure handled by catch block"
                );
                exchange.take_failure();
                exchange.set_property(keys::EXCEPTION_CAUGHT, failure.to_string());
                exchange.set_property(keys::FAILURE_STEP, failure.step().to_string());
                handler.run(exchange).await;
            }
        }

        if let Some(finally) = &self.finally {
            let pending = exchange.take_failure();
            let was_stopped = exchange.is_stopped();
            exchange.resume_routing();
            finally.run(exchange).await;
            if was_stopped {
                exchange.stop();
            }
            if let Some(pending) = pending {
                if !exchange.is_failed() {
                    exchange.set_failure(pending);
                }
            }
        }
        Ok(())
    }

    async fn start(&self) -> anyhow::Result<()> {
        for block in self.blocks() {
            block.start().await?;
        }
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        for block in self.blocks() {
            block.stop().await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use switchyard_core::Value;

    use super::*;
    use crate::processor::testing::exchange;
    use crate::processor::FnProcessor;

    #[derive(Debug, thiserror::Error)]
    #[error("stock exhausted")]
    struct OutOfStock;

    fn steps<F>(f: F) -> Pipeline
    where
        F: Fn(&mut Exchange) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Pipeline::new(vec![Arc::new(FnProcessor::new("step", f))])
    }

    fn append(suffix: &'static str) -> Pipeline {
        steps(move |ex| {
            let body = ex.body_as::<String>()?.unwrap_or_default();
            ex.set_body(format!("{body}{suffix}"));
            Ok(())
        })
    }

    #[tokio::test]
    async fn filter_runs_block_only_on_match() {
        let filter = Filter::new(Predicate::body_contains("keep"), append("+"));
        let mut kept = exchange("keep");
        let mut dropped = exchange("drop");
        filter.process(&mut kept).await.unwrap();
        filter.process(&mut dropped).await.unwrap();
        assert_eq!(kept.body(), &Value::from("keep+"));
        assert_eq!(dropped.body(), &Value::from("drop"));
    }

    #[tokio::test]
    async fn choice_takes_first_match_then_otherwise() {
        let choice = Choice::new(
            vec![
                (Predicate::body_contains("a"), append("-a")),
                (Predicate::body_contains("b"), append("-b")),
            ],
            Some(append("-other")),
        );
        for (input, expected) in [("ab", "ab-a"), ("b", "b-b"), ("z", "z-other")] {
            let mut ex = exchange(input);
            choice.process(&mut ex).await.unwrap();
            assert_eq!(ex.body(), &Value::from(expected));
        }
    }

    #[tokio::test]
    async fn loop_counts_and_sets_index() {
        let looped = Loop::new(LoopMode::Count(Expression::constant(3)), append("x"));
        let mut ex = exchange("");
        looped.process(&mut ex).await.unwrap();
        assert_eq!(ex.body(), &Value::from("xxx"));
        assert_eq!(ex.property(keys::LOOP_INDEX), Some(&Value::Int(2)));
    }

    #[tokio::test]
    async fn loop_while_checks_before_each_iteration() {
        let looped = Loop::new(
            LoopMode::While(Predicate::new(|ex| {
                ex.body().as_str().is_some_and(|s| s.len() < 4)
            })),
            append("y"),
        );
        let mut ex = exchange("");
        looped.process(&mut ex).await.unwrap();
        assert_eq!(ex.body(), &Value::from("yyyy"));
    }

    #[tokio::test]
    async fn catch_handles_matching_failure_and_finally_runs() {
        let try_block = DoTry::new(
            steps(|_| Err(anyhow::Error::new(OutOfStock).context("reserving stock"))),
            vec![
                (Catch::error::<std::io::Error>(), append("-io")),
                (Catch::error::<OutOfStock>(), append("-caught")),
            ],
            Some(append("-finally")),
        );
        let mut ex = exchange("order");
        try_block.process(&mut ex).await.unwrap();
        assert!(!ex.is_failed());
        assert_eq!(ex.body(), &Value::from("order-caught-finally"));
        assert!(ex
            .property(keys::EXCEPTION_CAUGHT)
            .and_then(Value::as_str)
            .is_some_and(|s| s.contains("stock exhausted")));
    }

    #[tokio::test]
    async fn unhandled_failure_survives_finally() {
        let try_block = DoTry::new(
            steps(|_| anyhow::bail!("fatal")),
            vec![(Catch::error::<OutOfStock>(), append("-caught"))],
            Some(append("-finally")),
        );
        let mut ex = exchange("order");
        try_block.process(&mut ex).await.unwrap();
        assert!(ex.is_failed());
        assert_eq!(ex.body(), &Value::from("order-finally"));
        assert!(Catch::message_contains("fatal").matches(ex.failure().unwrap()));
    }
}
