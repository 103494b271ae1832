//! Steps that send exchanges to endpoints: `to`, wire tap, enrich,
//! multicast, and recipient list.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt};
use futures_util::stream::{self, StreamExt};
use switchyard_core::{keys, Exchange, ExchangeFailure, ExchangePattern, Expression, Value};

use super::strategy::apply_result;
use super::{AggregationStrategy, Processor, UseLatest};
use crate::endpoint::{EndpointRegistry, Producer};
use crate::error::EngineError;

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Sends through `producer`, bounding request-reply exchanges by their
/// timeout (or `default_timeout`).
pub(crate) async fn send(
    producer: &dyn Producer,
    exchange: &mut Exchange,
    default_timeout: Duration,
) -> Result<(), EngineError> {
    if exchange.pattern() == ExchangePattern::InOnly {
        return producer.process(exchange).await;
    }
    let timeout = exchange.timeout().unwrap_or(default_timeout);
    let exchange_id = exchange.id().to_string();
    match tokio::time::timeout(timeout, producer.process(exchange)).await {
        Ok(result) => result,
        Err(_) => Err(EngineError::ExchangeTimedOut {
            exchange_id,
            timeout_ms: millis(timeout),
        }),
    }
}

// ---------------------------------------------------------------------------
// To
// ---------------------------------------------------------------------------

/// Sends the exchange to one endpoint, optionally overriding its pattern for
/// the duration of the send.
pub struct SendTo {
    name: String,
    uri: String,
    producer: Arc<dyn Producer>,
    pattern: Option<ExchangePattern>,
    default_timeout: Duration,
}

impl SendTo {
    #[must_use]
    pub fn new(
        uri: String,
        producer: Arc<dyn Producer>,
        pattern: Option<ExchangePattern>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            name: format!("to({uri})"),
            uri,
            producer,
            pattern,
            default_timeout,
        }
    }
}

#[async_trait]
impl Processor for SendTo {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        exchange.set_property(keys::TO_ENDPOINT, self.uri.clone());
        let original = exchange.pattern();
        if let Some(pattern) = self.pattern {
            exchange.set_pattern(pattern);
        }
        let result = send(self.producer.as_ref(), exchange, self.default_timeout).await;
        exchange.set_pattern(original);
        Ok(result?)
    }
}

// ---------------------------------------------------------------------------
// WireTap
// ---------------------------------------------------------------------------

/// Sends a fire-and-forget copy and continues immediately.
pub struct WireTap {
    name: String,
    producer: Arc<dyn Producer>,
}

impl WireTap {
    #[must_use]
    pub fn new(uri: &str, producer: Arc<dyn Producer>) -> Self {
        Self {
            name: format!("wireTap({uri})"),
            producer,
        }
    }
}

#[async_trait]
impl Processor for WireTap {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        let mut tapped = exchange.copy();
        tapped.set_pattern(ExchangePattern::InOnly);
        let producer = Arc::clone(&self.producer);
        let step = self.name.clone();
        tokio::spawn(async move {
            let outcome = producer.process(&mut tapped).await;
            match (outcome, tapped.failure()) {
                (Err(err), _) => {
                    tracing::warn!(%step, exchange_id = tapped.id(), error = %err, "wire tap send failed");
                }
                (Ok(()), Some(failure)) => {
                    tracing::warn!(%step, exchange_id = tapped.id(), %failure, "wire tap exchange failed");
                }
                (Ok(()), None) => {}
            }
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Enrich
// ---------------------------------------------------------------------------

/// Calls a resource endpoint request-reply with a copy and merges the reply.
///
/// Without a strategy the reply message replaces the in message. A failed
/// resource exchange fails this step.
pub struct Enrich {
    name: String,
    producer: Arc<dyn Producer>,
    strategy: Option<Arc<dyn AggregationStrategy>>,
    default_timeout: Duration,
}

impl Enrich {
    #[must_use]
    pub fn new(
        uri: &str,
        producer: Arc<dyn Producer>,
        strategy: Option<Arc<dyn AggregationStrategy>>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            name: format!("enrich({uri})"),
            producer,
            strategy,
            default_timeout,
        }
    }
}

#[async_trait]
impl Processor for Enrich {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        let mut resource = exchange.copy();
        resource.set_pattern(ExchangePattern::InOut);
        send(self.producer.as_ref(), &mut resource, self.default_timeout).await?;
        resource.promote_out();
        if let Some(failure) = resource.take_failure() {
            return Err(anyhow::Error::new(failure));
        }
        match &self.strategy {
            Some(strategy) => {
                let merged = strategy.aggregate(Some(exchange.clone()), resource);
                apply_result(exchange, merged);
            }
            None => exchange.set_message(resource.into_message()),
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fan-out: multicast and recipient list
// ---------------------------------------------------------------------------

/// How a fan-out step runs its branches and combines their results.
#[derive(Clone)]
pub struct FanOut {
    parallel: bool,
    limit: usize,
    strategy: Arc<dyn AggregationStrategy>,
    stop_on_exception: bool,
    default_timeout: Duration,
}

impl FanOut {
    #[must_use]
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            parallel: false,
            limit: 1,
            strategy: Arc::new(UseLatest),
            stop_on_exception: false,
            default_timeout,
        }
    }

    /// Runs up to `limit` branches at once.
    #[must_use]
    pub fn parallel(mut self, limit: usize) -> Self {
        self.parallel = true;
        self.limit = limit.max(1);
        self
    }

    #[must_use]
    pub fn strategy(mut self, strategy: Arc<dyn AggregationStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    #[must_use]
    pub fn stop_on_exception(mut self, stop: bool) -> Self {
        self.stop_on_exception = stop;
        self
    }

    /// Sends a copy of `exchange` to every target and folds the replies in
    /// target order. The first failed branch fails the step once the fold
    /// finishes, or immediately with `stop_on_exception`. A branch whose
    /// send returns an error counts as a failed branch.
    async fn run(
        &self,
        exchange: &mut Exchange,
        targets: Vec<(String, Arc<dyn Producer>)>,
    ) -> anyhow::Result<()> {
        let limit = if self.parallel { self.limit } else { 1 };
        let default_timeout = self.default_timeout;
        let branches: Vec<BoxFuture<'static, Branch>> = targets
            .into_iter()
            .enumerate()
            .map(|(index, (uri, producer))| {
                let mut branch = exchange.copy();
                branch.set_property(keys::MULTICAST_INDEX, i64::try_from(index).unwrap_or(i64::MAX));
                branch.set_property(keys::TO_ENDPOINT, uri.as_str());
                async move {
                    let sent = send(producer.as_ref(), &mut branch, default_timeout).await;
                    branch.promote_out();
                    Branch { uri, exchange: branch, sent }
                }
                .boxed()
            })
            .collect();
        let mut replies = stream::iter(branches).buffered(limit);

        let mut folded: Option<Exchange> = None;
        let mut first_failure: Option<ExchangeFailure> = None;
        while let Some(Branch { uri, exchange: mut reply, sent }) = replies.next().await {
            let failure = match sent {
                Err(err) => Some(ExchangeFailure::new(
                    format!("to({uri})"),
                    anyhow::Error::new(err),
                    reply.message(),
                )),
                Ok(()) => reply.take_failure(),
            };
            if let Some(failure) = failure {
                if first_failure.is_none() {
                    first_failure = Some(failure);
                }
                if self.stop_on_exception {
                    break;
                }
                continue;
            }
            folded = Some(self.strategy.aggregate(folded.take(), reply));
        }
        drop(replies);

        if let Some(result) = folded {
            apply_result(exchange, result);
        }
        match first_failure {
            Some(failure) => Err(anyhow::Error::new(failure)),
            None => Ok(()),
        }
    }
}

/// Outcome of one fan-out branch.
struct Branch {
    uri: String,
    exchange: Exchange,
    sent: Result<(), EngineError>,
}

/// Sends a copy to each of a fixed list of endpoints.
pub struct Multicast {
    targets: Vec<(String, Arc<dyn Producer>)>,
    fan_out: FanOut,
}

impl Multicast {
    #[must_use]
    pub fn new(targets: Vec<(String, Arc<dyn Producer>)>, fan_out: FanOut) -> Self {
        Self { targets, fan_out }
    }
}

#[async_trait]
impl Processor for Multicast {
    fn name(&self) -> &str {
        "multicast"
    }

    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        self.fan_out.run(exchange, self.targets.clone()).await
    }
}

/// Sends a copy to each endpoint named by an expression evaluated per
/// exchange. Text values are split on the delimiter; lists are used as-is.
pub struct RecipientList {
    expression: Expression,
    delimiter: String,
    endpoints: Arc<EndpointRegistry>,
    producers: DashMap<String, Arc<dyn Producer>>,
    fan_out: FanOut,
}

impl RecipientList {
    #[must_use]
    pub fn new(
        expression: Expression,
        delimiter: String,
        endpoints: Arc<EndpointRegistry>,
        fan_out: FanOut,
    ) -> Self {
        Self {
            expression,
            delimiter,
            endpoints,
            producers: DashMap::new(),
            fan_out,
        }
    }

    fn recipients(&self, value: &Value) -> Vec<String> {
        let raw: Vec<String> = match value {
            Value::Null => Vec::new(),
            Value::List(items) => items.iter().map(ToString::to_string).collect(),
            other => other
                .to_string()
                .split(self.delimiter.as_str())
                .map(str::to_string)
                .collect(),
        };
        raw.into_iter()
            .map(|uri| uri.trim().to_string())
            .filter(|uri| !uri.is_empty())
            .collect()
    }

    fn producer(&self, uri: &str) -> Result<Arc<dyn Producer>, EngineError> {
        if let Some(cached) = self.producers.get(uri) {
            return Ok(Arc::clone(cached.value()));
        }
        let producer = self.endpoints.resolve(uri)?.create_producer()?;
        self.producers.insert(uri.to_string(), Arc::clone(&producer));
        Ok(producer)
    }
}

#[async_trait]
impl Processor for RecipientList {
    fn name(&self) -> &str {
        "recipientList"
    }

    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        let value = self.expression.evaluate(exchange)?;
        let targets = self
            .recipients(&value)
            .into_iter()
            .map(|uri| {
                let producer = self.producer(&uri)?;
                Ok((uri, producer))
            })
            .collect::<Result<Vec<_>, EngineError>>()?;
        tracing::trace!(exchange_id = exchange.id(), recipients = targets.len(), "recipient list resolved");
        self.fan_out.run(exchange, targets).await
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.producers.clear();
        Ok(())
    }
}
