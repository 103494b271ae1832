//! `direct:name` -- synchronous in-process call into the route consuming
//! from the same name.
//!
//! The producer runs the consumer's route on the calling task and adopts
//! the resulting exchange. Only one consumer may be bound per name.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use switchyard_core::Exchange;
use tokio::sync::Notify;

use super::adopt_reply;
use crate::endpoint::{
    Component, ComponentContext, Consumer, Endpoint, EndpointParams, Producer, RouteBinding,
};
use crate::error::EngineError;

const PARAMETERS: &[&str] = &["block", "timeout"];

/// The consumer slot shared by every endpoint of one name.
#[derive(Default)]
struct Channel {
    consumer: RwLock<Option<RouteBinding>>,
    suspended: AtomicBool,
    bound: Notify,
}

impl Channel {
    fn active(&self) -> Option<RouteBinding> {
        if self.suspended.load(Ordering::Acquire) {
            return None;
        }
        self.consumer.read().clone()
    }
}

pub struct DirectComponent {
    channels: DashMap<String, Arc<Channel>>,
}

impl DirectComponent {
    #[must_use]
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }
}

impl Default for DirectComponent {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Component for DirectComponent {
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
            return Err(EngineError::invalid_endpoint(params.uri(), "direct endpoint needs a name"));
        }
        let channel = Arc::clone(self.channels.entry(name.to_string()).or_default().value());
        Ok(Arc::new(DirectEndpoint {
            uri: params.uri().to_string(),
            block: params.flag("block", false)?,
            timeout: params.millis("timeout", 30_000)?,
            channel,
        }))
    }
}

pub struct DirectEndpoint {
    uri: String,
    block: bool,
    timeout: Duration,
    channel: Arc<Channel>,
}

impl DirectEndpoint {
    /// Whether a route currently consumes from this endpoint.
    #[must_use]
    pub fn has_consumer(&self) -> bool {
        self.channel.consumer.read().is_some()
    }

    async fn await_consumer(&self) -> Result<RouteBinding, EngineError> {
        if let Some(binding) = self.channel.active() {
            return Ok(binding);
        }
        let unavailable = || EngineError::DirectConsumerNotAvailable {
            uri: self.uri.clone(),
        };
        if !self.block {
            return Err(unavailable());
        }
        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            let bound = self.channel.bound.notified();
            if let Some(binding) = self.channel.active() {
                return Ok(binding);
            }
            if tokio::time::timeout_at(deadline, bound).await.is_err() {
                return Err(unavailable());
            }
        }
    }
}

impl Endpoint for DirectEndpoint {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn create_producer(&self) -> Result<Arc<dyn Producer>, EngineError> {
        Ok(Arc::new(DirectProducer {
            endpoint: DirectEndpoint {
                uri: self.uri.clone(),
                block: self.block,
                timeout: self.timeout,
                channel: Arc::clone(&self.channel),
            },
        }))
    }

    fn create_consumer(&self, binding: RouteBinding) -> Result<Box<dyn Consumer>, EngineError> {
        Ok(Box::new(DirectConsumer {
            uri: self.uri.clone(),
            channel: Arc::clone(&self.channel),
            binding,
        }))
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

struct DirectProducer {
    endpoint: DirectEndpoint,
}

#[async_trait]
impl Producer for DirectProducer {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), EngineError> {
        let binding = self.endpoint.await_consumer().await?;
        let reply = binding.deliver(exchange.clone()).await?;
        adopt_reply(exchange, reply);
        Ok(())
    }
}

struct DirectConsumer {
    uri: String,
    channel: Arc<Channel>,
    binding: RouteBinding,
}

#[async_trait]
impl Consumer for DirectConsumer {
    async fn start(&self) -> anyhow::Result<()> {
        {
            let mut slot = self.channel.consumer.write();
            if let Some(existing) = slot.as_ref() {
                anyhow::bail!(
                    "`{}` already has a consumer (route `{}`)",
                    self.uri,
                    existing.route_id
                );
            }
            *slot = Some(self.binding.clone());
        }
        self.channel.suspended.store(false, Ordering::Release);
        self.channel.bound.notify_waiters();
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        let mut slot = self.channel.consumer.write();
        if slot.as_ref().is_some_and(|b| b.route_id == self.binding.route_id) {
            *slot = None;
        }
        Ok(())
    }

    fn supports_suspension(&self) -> bool {
        true
    }

    async fn suspend(&self) -> anyhow::Result<()> {
        self.channel.suspended.store(true, Ordering::Release);
        Ok(())
    }

    async fn resume(&self) -> anyhow::Result<()> {
        self.channel.suspended.store(false, Ordering::Release);
        self.channel.bound.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use switchyard_core::{ExchangePattern, Value};

    use crate::context::SwitchyardContext;
    use crate::error::EngineError;
    use crate::route::{RouteBuilder, StepsDsl};

    #[tokio::test]
    async fn send_without_consumer_fails() {
        let ctx = SwitchyardContext::new();
        let err = ctx.producer_template().send_body("direct:nobody", "x").await.unwrap_err();
        assert!(matches!(err, EngineError::DirectConsumerNotAvailable { uri } if uri == "direct:nobody"));
    }

    #[tokio::test]
    async fn blocking_producer_waits_for_consumer() {
        let ctx = SwitchyardContext::new();
        ctx.start().await.unwrap();
        let template = ctx.producer_template();
        let pending = tokio::spawn(async move {
            template.request_body("direct:late?block=true&timeout=2000", "hi").await
        });

        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        ctx.add_routes([RouteBuilder::from("direct:late").set_body("answered")])
            .await
            .unwrap();
        assert_eq!(pending.await.unwrap().unwrap(), Value::from("answered"));
        ctx.stop().await;
    }

    #[tokio::test]
    async fn second_consumer_on_same_name_fails_to_start() {
        let ctx = SwitchyardContext::new();
        ctx.add_routes([
            RouteBuilder::from("direct:one").route_id("first"),
            RouteBuilder::from("direct:one").route_id("second"),
        ])
        .await
        .unwrap();
        let err = ctx.start().await.unwrap_err();
        assert!(err.to_string().contains("already has a consumer"));
    }

    #[tokio::test]
    async fn changes_made_by_the_called_route_are_visible() {
        let ctx = SwitchyardContext::new();
        ctx.add_routes([
            RouteBuilder::from("direct:outer")
                .route_id("outer")
                .to("direct:inner")
                .to("mock:after"),
            RouteBuilder::from("direct:inner")
                .route_id("inner")
                .set_header("visited", Value::Bool(true)),
        ])
        .await
        .unwrap();
        ctx.start().await.unwrap();

        ctx.producer_template().send_body("direct:outer", "x").await.unwrap();
        let seen = ctx.mock("mock:after").unwrap().received_exchanges();
        assert_eq!(seen[0].header("visited"), Some(&Value::Bool(true)));
        assert_eq!(seen[0].route_id(), Some("outer"));
        assert_eq!(seen[0].pattern(), ExchangePattern::InOnly);
        ctx.stop().await;
    }
}
