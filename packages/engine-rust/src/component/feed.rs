//! `feed:name` -- an ordered in-memory change feed.
//!
//! A [`ChangeFeed`] is bound in the context registry under `name`. The
//! consumer delivers events in sequence order and acknowledges each one by
//! advancing a cursor that lives on the endpoint, so a stopped and restarted
//! route continues after the last event it finished. The producer publishes
//! the message body as a new event.

use std::any::Any;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use switchyard_core::{Exchange, ExchangePattern, Message, Value};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::RetryConfig;
use crate::endpoint::{
    Component, ComponentContext, Consumer, Endpoint, EndpointParams, Producer, RouteBinding,
};
use crate::error::EngineError;

/// Key of the changed entry.
pub const FEED_KEY: &str = "SwitchyardFeedKey";
/// `PUT`, `UPDATE` or `DELETE`.
pub const FEED_OPERATION: &str = "SwitchyardFeedOperation";
/// Sequence number of the event.
pub const FEED_SEQUENCE: &str = "SwitchyardFeedSequence";

const PARAMETERS: &[&str] = &["batchSize", "pollDelay"];

// ---------------------------------------------------------------------------
// ChangeFeed
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Put,
    Update,
    Delete,
}

impl ChangeKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeKind::Put => "PUT",
            ChangeKind::Update => "UPDATE",
            ChangeKind::Delete => "DELETE",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeKind {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PUT" => Ok(ChangeKind::Put),
            "UPDATE" => Ok(ChangeKind::Update),
            "DELETE" => Ok(ChangeKind::Delete),
            _ => Err(FeedError::UnknownOperation(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    /// Starts at 1 and increases by one per event.
    pub sequence: u64,
    pub kind: ChangeKind,
    pub key: String,
    pub value: Value,
}

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("change feed is unavailable: {0}")]
    Unavailable(String),
    #[error("unknown change operation `{0}`")]
    UnknownOperation(String),
}

/// Append-only log of keyed changes.
#[derive(Debug, Default)]
pub struct ChangeFeed {
    events: RwLock<Vec<ChangeEvent>>,
    unavailable: RwLock<Option<String>>,
    appended: Notify,
}

impl ChangeFeed {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an event and returns its sequence number.
    pub fn publish(&self, kind: ChangeKind, key: impl Into<String>, value: impl Into<Value>) -> u64 {
        let sequence = {
            let mut events = self.events.write();
            let sequence = u64::try_from(events.len()).unwrap_or(u64::MAX) + 1;
            events.push(ChangeEvent {
                sequence,
                kind,
                key: key.into(),
                value: value.into(),
            });
            sequence
        };
        self.appended.notify_waiters();
        sequence
    }

    pub fn put(&self, key: impl Into<String>, value: impl Into<Value>) -> u64 {
        self.publish(ChangeKind::Put, key, value)
    }

    pub fn update(&self, key: impl Into<String>, value: impl Into<Value>) -> u64 {
        self.publish(ChangeKind::Update, key, value)
    }

    pub fn delete(&self, key: impl Into<String>) -> u64 {
        self.publish(ChangeKind::Delete, key, Value::Null)
    }

    /// Up to `max` events with a sequence greater than `cursor`.
    ///
    /// # Errors
    ///
    /// [`FeedError::Unavailable`] while the feed is marked unavailable.
    pub fn read_from(&self, cursor: u64, max: usize) -> Result<Vec<ChangeEvent>, FeedError> {
        if let Some(reason) = self.unavailable.read().as_ref() {
            return Err(FeedError::Unavailable(reason.clone()));
        }
        let start = usize::try_from(cursor).unwrap_or(usize::MAX);
        let events = self.events.read();
        Ok(events.iter().skip(start).take(max).cloned().collect())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Makes reads fail with `reason` until called again with `None`.
    pub fn set_unavailable(&self, reason: Option<&str>) {
        *self.unavailable.write() = reason.map(str::to_string);
        if reason.is_none() {
            self.appended.notify_waiters();
        }
    }
}

// ---------------------------------------------------------------------------
// Component / endpoint
// ---------------------------------------------------------------------------

pub struct FeedComponent;

#[async_trait]
impl Component for FeedComponent {
    fn parameter_names(&self) -> &[&'static str] {
        PARAMETERS
    }

    fn create_endpoint(
        &self,
        params: &EndpointParams,
        ctx: &ComponentContext,
    ) -> Result<Arc<dyn Endpoint>, EngineError> {
        let name = params.path().trim();
        let feed = ctx.registry.lookup::<ChangeFeed>(name).ok_or_else(|| {
            EngineError::invalid_endpoint(params.uri(), format!("no change feed bound as `{name}`"))
        })?;
        let batch_size = params.parse_or("batchSize", 100usize)?;
        if batch_size == 0 {
            return Err(EngineError::invalid_endpoint(params.uri(), "batchSize must be at least 1"));
        }
        Ok(Arc::new(FeedEndpoint {
            uri: params.uri().to_string(),
            feed,
            settings: FeedSettings {
                batch_size,
                poll_delay: params.millis("pollDelay", 500)?,
                retry: ctx.config.consumer_retry.clone(),
            },
            cursor: Arc::new(AtomicU64::new(0)),
        }))
    }
}

#[derive(Debug, Clone)]
struct FeedSettings {
    batch_size: usize,
    poll_delay: Duration,
    retry: RetryConfig,
}

pub struct FeedEndpoint {
    uri: String,
    feed: Arc<ChangeFeed>,
    settings: FeedSettings,
    cursor: Arc<AtomicU64>,
}

impl FeedEndpoint {
    /// Sequence of the last acknowledged event.
    #[must_use]
    pub fn cursor(&self) -> u64 {
        self.cursor.load(Ordering::Acquire)
    }
}

impl Endpoint for FeedEndpoint {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn create_producer(&self) -> Result<Arc<dyn Producer>, EngineError> {
        Ok(Arc::new(FeedProducer {
            feed: Arc::clone(&self.feed),
        }))
    }

    fn create_consumer(&self, binding: RouteBinding) -> Result<Box<dyn Consumer>, EngineError> {
        Ok(Box::new(FeedConsumer {
            reader: FeedReader {
                feed: Arc::clone(&self.feed),
                settings: self.settings.clone(),
                cursor: Arc::clone(&self.cursor),
                paused: Arc::new(AtomicBool::new(false)),
                binding,
            },
            running: Mutex::new(None),
        }))
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

// ---------------------------------------------------------------------------
// Consumer
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct FeedReader {
    feed: Arc<ChangeFeed>,
    settings: FeedSettings,
    cursor: Arc<AtomicU64>,
    paused: Arc<AtomicBool>,
    binding: RouteBinding,
}

impl FeedReader {
    async fn run(self, cancel: CancellationToken) {
        let mut failures: u32 = 0;
        loop {
            let wait = if self.paused.load(Ordering::Acquire) {
                self.settings.poll_delay
            } else {
                let cursor = self.cursor.load(Ordering::Acquire);
                match self.feed.read_from(cursor, self.settings.batch_size) {
                    Ok(events) => {
                        if failures > 0 {
                            failures = 0;
                            self.binding.health.report_up();
                        }
                        if events.is_empty() || !self.deliver_batch(events, &cancel).await {
                            self.settings.poll_delay
                        } else {
                            Duration::ZERO
                        }
                    }
                    Err(err) => {
                        failures += 1;
                        tracing::warn!(
                            route_id = %self.binding.route_id,
                            attempt = failures,
                            error = %err,
                            "reading change feed failed"
                        );
                        if failures >= self.settings.retry.max_attempts {
                            self.binding.health.report_down(err.to_string());
                        }
                        self.settings.retry.backoff_for(failures)
                    }
                }
            };

            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                () = self.feed.appended.notified(), if !wait.is_zero() && failures == 0 => {}
                () = tokio::time::sleep(wait) => {}
            }
        }
        tracing::debug!(route_id = %self.binding.route_id, "change feed reader stopped");
    }

    /// Delivers events in order, acknowledging each one the route finished.
    /// Returns whether the whole batch was acknowledged.
    async fn deliver_batch(&self, events: Vec<ChangeEvent>, cancel: &CancellationToken) -> bool {
        for event in events {
            if cancel.is_cancelled() || self.paused.load(Ordering::Acquire) {
                return false;
            }
            let message = Message::new(event.value)
                .with_header(FEED_KEY, event.key.as_str())
                .with_header(FEED_OPERATION, event.kind.as_str())
                .with_header(FEED_SEQUENCE, i64::try_from(event.sequence).unwrap_or(i64::MAX));
            let exchange = self.binding.new_exchange(ExchangePattern::InOnly, message);

            match self.binding.deliver(exchange).await {
                Ok(done) => {
                    if let Some(failure) = done.failure() {
                        tracing::warn!(
                            route_id = %self.binding.route_id,
                            sequence = event.sequence,
                            key = %event.key,
                            error = %failure,
                            "change event failed"
                        );
                    }
                    self.cursor.store(event.sequence, Ordering::Release);
                }
                Err(err) => {
                    tracing::warn!(
                        route_id = %self.binding.route_id,
                        sequence = event.sequence,
                        error = %err,
                        "route refused change event; will retry"
                    );
                    return false;
                }
            }
        }
        true
    }
}

struct FeedConsumer {
    reader: FeedReader,
    running: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

#[async_trait]
impl Consumer for FeedConsumer {
    async fn start(&self) -> anyhow::Result<()> {
        let mut running = self.running.lock();
        if running.is_none() {
            let cancel = CancellationToken::new();
            self.reader.paused.store(false, Ordering::Release);
            let handle = tokio::spawn(self.reader.clone().run(cancel.clone()));
            *running = Some((cancel, handle));
        }
        Ok(())
    }

    /// Waits for the event being delivered, so a restart never sees a stale
    /// cursor.
    async fn stop(&self) -> anyhow::Result<()> {
        let running = self.running.lock().take();
        if let Some((cancel, handle)) = running {
            cancel.cancel();
            handle.await?;
        }
        Ok(())
    }

    fn supports_suspension(&self) -> bool {
        true
    }

    async fn suspend(&self) -> anyhow::Result<()> {
        self.reader.paused.store(true, Ordering::Release);
        Ok(())
    }

    async fn resume(&self) -> anyhow::Result<()> {
        self.reader.paused.store(false, Ordering::Release);
        self.reader.feed.appended.notify_waiters();
        Ok(())
    }
}

impl Drop for FeedConsumer {
    fn drop(&mut self) {
        if let Some((cancel, _)) = self.running.get_mut().take() {
            cancel.cancel();
        }
    }
}

// ---------------------------------------------------------------------------
// Producer
// ---------------------------------------------------------------------------

struct FeedProducer {
    feed: Arc<ChangeFeed>,
}

#[async_trait]
impl Producer for FeedProducer {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), EngineError> {
        let Some(key) = exchange.header(FEED_KEY).map(ToString::to_string) else {
            exchange.fail("feed", anyhow::anyhow!("missing {FEED_KEY} header"));
            return Ok(());
        };
        let kind = match exchange.header(FEED_OPERATION).and_then(Value::as_str) {
            Some(op) => match op.parse::<ChangeKind>() {
                Ok(kind) => kind,
                Err(err) => {
                    exchange.fail("feed", err.into());
                    return Ok(());
                }
            },
            None => ChangeKind::Put,
        };
        let sequence = self.feed.publish(kind, key, exchange.body().clone());
        exchange.set_header(FEED_SEQUENCE, i64::try_from(sequence).unwrap_or(i64::MAX));
        Ok(())
    }
}
