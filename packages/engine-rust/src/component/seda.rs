//! `seda:name` -- bounded in-memory queue between routes.
//!
//! Producers enqueue and return immediately for fire-and-forget exchanges;
//! request-reply producers wait for the consuming route to finish. The
//! consumer runs `concurrentConsumers` workers pulling from the queue.
//! Suspending stops the workers but leaves queued exchanges in place.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use switchyard_core::{Exchange, ExchangePattern};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::adopt_reply;
use crate::endpoint::{
    Component, ComponentContext, Consumer, Endpoint, EndpointParams, Producer, RouteBinding,
};
use crate::error::EngineError;

const PARAMETERS: &[&str] = &["size", "concurrentConsumers", "blockWhenFull", "timeout"];
const DEFAULT_SIZE: usize = 1000;

type Reply = oneshot::Sender<Result<Exchange, EngineError>>;

struct Queued {
    exchange: Exchange,
    reply: Option<Reply>,
}

/// One named queue. Every endpoint with the same name shares it; the first
/// endpoint resolved fixes its capacity.
struct Queue {
    name: String,
    tx: mpsc::Sender<Queued>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Queued>>>,
}

impl Queue {
    fn new(name: &str, size: usize) -> Self {
        let (tx, rx) = mpsc::channel(size);
        Self {
            name: name.to_string(),
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
        }
    }

    fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

pub struct SedaComponent {
    queues: DashMap<String, Arc<Queue>>,
}

impl SedaComponent {
    #[must_use]
    pub fn new() -> Self {
        Self {
            queues: DashMap::new(),
        }
    }
}

impl Default for SedaComponent {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Component for SedaComponent {
    fn parameter_names(&self) -> &[&'static str] {
        PARAMETERS
    }

    fn create_endpoint(
        &self,
        params: &EndpointParams,
        _ctx: &ComponentContext,
    ) -> Result<Arc<dyn Endpoint>, EngineError> {
        let name = params.path().trim();
        if name.is_empty() {
            return Err(EngineError::invalid_endpoint(params.uri(), "seda endpoint needs a name"));
        }
        let size = params.parse_or("size", DEFAULT_SIZE)?;
        let consumers = params.parse_or("concurrentConsumers", 1usize)?;
        if size == 0 {
            return Err(EngineError::invalid_endpoint(params.uri(), "size must be at least 1"));
        }
        if consumers == 0 {
            return Err(EngineError::invalid_endpoint(
                params.uri(),
                "concurrentConsumers must be at least 1",
            ));
        }
        let queue = Arc::clone(
            self.queues
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Queue::new(name, size)))
                .value(),
        );
        Ok(Arc::new(SedaEndpoint {
            uri: params.uri().to_string(),
            queue,
            consumers,
            block_when_full: params.flag("blockWhenFull", false)?,
            timeout: params.millis("timeout", 30_000)?,
        }))
    }
}

pub struct SedaEndpoint {
    uri: String,
    queue: Arc<Queue>,
    consumers: usize,
    block_when_full: bool,
    timeout: Duration,
}

impl SedaEndpoint {
    /// Exchanges currently waiting in the queue.
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }
}

impl Endpoint for SedaEndpoint {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn create_producer(&self) -> Result<Arc<dyn Producer>, EngineError> {
        Ok(Arc::new(SedaProducer {
            queue: Arc::clone(&self.queue),
            block_when_full: self.block_when_full,
            timeout: self.timeout,
        }))
    }

    fn create_consumer(&self, binding: RouteBinding) -> Result<Box<dyn Consumer>, EngineError> {
        Ok(Box::new(SedaConsumer {
            queue: Arc::clone(&self.queue),
            workers: self.consumers,
            binding,
            running: Mutex::new(None),
        }))
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

// ---------------------------------------------------------------------------
// Producer
// ---------------------------------------------------------------------------

struct SedaProducer {
    queue: Arc<Queue>,
    block_when_full: bool,
    timeout: Duration,
}

impl SedaProducer {
    async fn enqueue(&self, item: Queued) -> Result<(), EngineError> {
        let full = || EngineError::QueueFull {
            queue: self.queue.name.clone(),
        };
        if self.block_when_full {
            self.queue
                .tx
                .send_timeout(item, self.timeout)
                .await
                .map_err(|_| full())
        } else {
            self.queue.tx.try_send(item).map_err(|_| full())
        }
    }
}

#[async_trait]
impl Producer for SedaProducer {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), EngineError> {
        if exchange.pattern() == ExchangePattern::InOnly {
            return self
                .enqueue(Queued {
                    exchange: exchange.clone(),
                    reply: None,
                })
                .await;
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.enqueue(Queued {
            exchange: exchange.clone(),
            reply: Some(reply_tx),
        })
        .await?;

        let timed_out = || EngineError::ExchangeTimedOut {
            exchange_id: exchange.id().to_string(),
            timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
        };
        let reply = match tokio::time::timeout(self.timeout, reply_rx).await {
            Ok(Ok(reply)) => reply?,
            Ok(Err(_)) => {
                return Err(anyhow::anyhow!(
                    "consumer of seda queue `{}` stopped before replying",
                    self.queue.name
                )
                .into())
            }
            Err(_) => return Err(timed_out()),
        };
        adopt_reply(exchange, reply);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Consumer
// ---------------------------------------------------------------------------

struct Workers {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

struct SedaConsumer {
    queue: Arc<Queue>,
    workers: usize,
    binding: RouteBinding,
    running: Mutex<Option<Workers>>,
}

impl SedaConsumer {
    fn spawn_workers(&self) {
        let mut running = self.running.lock();
        if running.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let handles = (0..self.workers)
            .map(|_| {
                tokio::spawn(work(
                    Arc::clone(&self.queue.rx),
                    self.binding.clone(),
                    cancel.clone(),
                ))
            })
            .collect();
        *running = Some(Workers { cancel, handles });
    }

    /// Cancels the workers. Exchanges a worker already took off the queue
    /// finish on their own.
    fn cancel_workers(&self) {
        if let Some(workers) = self.running.lock().take() {
            workers.cancel.cancel();
            drop(workers.handles);
        }
    }
}

async fn work(
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Queued>>>,
    binding: RouteBinding,
    cancel: CancellationToken,
) {
    loop {
        let item = {
            let mut rx = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                rx = rx.lock() => rx,
            };
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                item = rx.recv() => item,
            }
        };
        let Some(Queued { exchange, reply }) = item else {
            break;
        };
        match reply {
            Some(reply) => {
                let _ = reply.send(binding.deliver(exchange).await);
            }
            None => {
                binding.deliver_logged(exchange).await;
            }
        }
    }
    tracing::debug!(route_id = %binding.route_id, "seda worker stopped");
}

#[async_trait]
impl Consumer for SedaConsumer {
    async fn start(&self) -> anyhow::Result<()> {
        self.spawn_workers();
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.cancel_workers();
        Ok(())
    }

    fn supports_suspension(&self) -> bool {
        true
    }

    async fn suspend(&self) -> anyhow::Result<()> {
        self.cancel_workers();
        Ok(())
    }

    async fn resume(&self) -> anyhow::Result<()> {
        self.spawn_workers();
        Ok(())
    }
}

impl Drop for SedaConsumer {
    fn drop(&mut self) {
        self.cancel_workers();
    }
}
