//! Pipeline executor and the processors that make up a route.
//!
//! - [`transform`]: body/header/property manipulation, conversion, data formats, log, delay, stop
//! - [`flow`]: filter, choice, loop, and try/catch/finally
//! - [`send`]: to, wire tap, enrich, multicast, recipient list
//! - [`split`]: splitter with optional parallelism and aggregation
//! - [`aggregate`]: correlation-based aggregator with completion conditions
//! - [`threads`]: hands nested steps to a bounded worker pool
//! - [`strategy`]: aggregation strategies

pub mod aggregate;
pub mod flow;
pub mod send;
pub mod split;
pub mod strategy;
pub mod threads;
pub mod transform;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use switchyard_core::{keys, Exchange};

pub use strategy::{AggregationStrategy, GroupedBodies, SharedStrategy, StringConcat, UseLatest};

// ---------------------------------------------------------------------------
// Processor
// ---------------------------------------------------------------------------

/// One step of a route.
///
/// Processors are shared by every exchange flowing through the route, so
/// `process` takes `&self` and must be reentrant. An `Err` is captured on
/// the exchange as a failure of this step.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Step name used in failures and logs, e.g. `to(mock:out)`.
    fn name(&self) -> &str;

    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()>;

    /// Called when the owning route starts.
    async fn start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called when the owning route stops.
    async fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

type ProcessFn = Arc<dyn Fn(&mut Exchange) -> anyhow::Result<()> + Send + Sync>;

/// A processor backed by a synchronous closure.
pub struct FnProcessor {
    name: String,
    f: ProcessFn,
}

impl FnProcessor {
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut Exchange) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            f: Arc::new(f),
        }
    }

    pub(crate) fn from_shared(name: impl Into<String>, f: ProcessFn) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl Processor for FnProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        (self.f)(exchange)
    }
}

// ---------------------------------------------------------------------------
// RedeliveryPolicy
// ---------------------------------------------------------------------------

/// How often a failing step is retried before its failure is recorded.
#[derive(Debug, Clone, PartialEq)]
pub struct RedeliveryPolicy {
    pub maximum_redeliveries: u32,
    pub redelivery_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self {
            maximum_redeliveries: 0,
            redelivery_delay: Duration::from_millis(100),
            backoff_multiplier: 1.0,
        }
    }
}

impl RedeliveryPolicy {
    /// Delay before redelivery `attempt` (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let factor = self.backoff_multiplier.max(1.0).powi(exponent);
        self.redelivery_delay.mul_f64(factor.min(1_000.0))
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// An ordered chain of processors.
///
/// Cheap to clone; nested blocks (filter bodies, split steps) are pipelines
/// of their own.
#[derive(Clone)]
pub struct Pipeline {
    steps: Arc<[Arc<dyn Processor>]>,
    redelivery: Arc<RedeliveryPolicy>,
}

impl Pipeline {
    #[must_use]
    pub fn new(steps: Vec<Arc<dyn Processor>>) -> Self {
        Self {
            steps: steps.into(),
            redelivery: Arc::new(RedeliveryPolicy::default()),
        }
    }

    #[must_use]
    pub fn with_redelivery(mut self, policy: RedeliveryPolicy) -> Self {
        self.redelivery = Arc::new(policy);
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Runs the exchange through every step.
    ///
    /// Stops at the first failure or once routing is stopped. A step's out
    /// message is promoted to the in message before the next step runs.
    pub async fn run(&self, exchange: &mut Exchange) {
        for step in self.steps.iter() {
            if exchange.is_stopped() || exchange.is_failed() {
                break;
            }
            self.run_step(step.as_ref(), exchange).await;
            exchange.promote_out();
        }
    }

    async fn run_step(&self, step: &dyn Processor, exchange: &mut Exchange) {
        let mut attempt = 0u32;
        loop {
            match step.process(exchange).await {
                Ok(()) => return,
                Err(err) if attempt < self.redelivery.maximum_redeliveries => {
                    attempt += 1;
                    tracing::debug!(
                        step = step.name(),
                        exchange_id = exchange.id(),
                        attempt,
                        error = %err,
                        "redelivering"
                    );
                    exchange.set_property(keys::REDELIVERY_COUNTER, i64::from(attempt));
                    let delay = self.redelivery.delay_for(attempt);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(err) => {
                    exchange.fail(step.name(), err);
                    return;
                }
            }
        }
    }

    /// Starts every step in order.
    ///
    /// # Errors
    ///
    /// Returns the first step's start error; steps already started are
    /// stopped again.
    pub async fn start(&self) -> anyhow::Result<()> {
        for (i, step) in self.steps.iter().enumerate() {
            if let Err(err) = step.start().await {
                for started in self.steps[..i].iter().rev() {
                    if let Err(stop_err) = started.stop().await {
                        tracing::warn!(step = started.name(), error = %stop_err, "step stop failed");
                    }
                }
                return Err(err).with_context(|| format!("starting step `{}`", step.name()));
            }
        }
        Ok(())
    }

    /// Stops every step in reverse order, logging failures.
    pub async fn stop(&self) {
        for step in self.steps.iter().rev() {
            if let Err(err) = step.stop().await {
                tracing::warn!(step = step.name(), error = %err, "step stop failed");
            }
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.steps.iter().map(|s| s.name()))
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use switchyard_core::{Exchange, TypeConverterRegistry, Value};

    pub fn exchange(body: impl Into<Value>) -> Exchange {
        let mut ex = Exchange::new(Arc::new(TypeConverterRegistry::with_defaults()));
        ex.set_body(body);
        ex
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use switchyard_core::{Message, Value};

    use super::testing::exchange;
    use super::*;

    fn step<F>(name: &str, f: F) -> Arc<dyn Processor>
    where
        F: Fn(&mut Exchange) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Arc::new(FnProcessor::new(name, f))
    }

    #[tokio::test]
    async fn runs_steps_in_order_and_promotes_out() {
        let pipeline = Pipeline::new(vec![
            step("reply", |ex| {
                ex.set_out(Message::new("from out"));
                Ok(())
            }),
            step("append", |ex| {
                let body = ex.body_as::<String>()?.unwrap_or_default();
                ex.set_body(format!("{body}!"));
                Ok(())
            }),
        ]);

        let mut ex = exchange("in");
        pipeline.run(&mut ex).await;
        assert_eq!(ex.body(), &Value::from("from out!"));
    }

    #[tokio::test]
    async fn first_failure_stops_the_pipeline() {
        let reached = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&reached);
        let pipeline = Pipeline::new(vec![
            step("explode", |_| Err(anyhow::anyhow!("boom"))),
            step("after", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        ]);

        let mut ex = exchange("x");
        pipeline.run(&mut ex).await;
        assert_eq!(ex.failure().unwrap().step(), "explode");
        assert_eq!(reached.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stop_flag_skips_remaining_steps() {
        let pipeline = Pipeline::new(vec![
            step("stop", |ex| {
                ex.stop();
                Ok(())
            }),
            step("never", |ex| {
                ex.set_body("changed");
                Ok(())
            }),
        ]);
        let mut ex = exchange("original");
        pipeline.run(&mut ex).await;
        assert!(ex.is_stopped());
        assert_eq!(ex.body(), &Value::from("original"));
    }

    #[tokio::test]
    async fn redelivery_retries_the_failing_step() {
        let attempts = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&attempts);
        let pipeline = Pipeline::new(vec![step("flaky", move |_| {
            if seen.fetch_add(1, Ordering::SeqCst) < 2 {
                anyhow::bail!("not yet");
            }
            Ok(())
        })])
        .with_redelivery(RedeliveryPolicy {
            maximum_redeliveries: 3,
            redelivery_delay: Duration::ZERO,
            backoff_multiplier: 2.0,
        });

        let mut ex = exchange("x");
        pipeline.run(&mut ex).await;
        assert!(!ex.is_failed());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(ex.property(keys::REDELIVERY_COUNTER), Some(&Value::Int(2)));
    }

    #[test]
    fn redelivery_delay_backs_off() {
        let policy = RedeliveryPolicy {
            maximum_redeliveries: 3,
            redelivery_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
    }
}
