//! `mock:name` -- records every exchange it receives and checks
//! expectations against them.
//!
//! ```ignore
//! let mock = ctx.mock("mock:out")?;
//! mock.expect_bodies_received(["a", "b"]);
//! template.send_body("direct:in", "a").await?;
//! template.send_body("direct:in", "b").await?;
//! mock.assert_is_satisfied(Duration::from_secs(1)).await?;
//! ```

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use switchyard_core::{Exchange, Value};
use tokio::sync::Notify;

use crate::endpoint::{
    unsupported, Component, ComponentContext, Consumer, Endpoint, EndpointParams, Producer,
    RouteBinding,
};
use crate::error::EngineError;

type Responder = Arc<dyn Fn(&mut Exchange) -> anyhow::Result<()> + Send + Sync>;

pub struct MockComponent;

#[async_trait]
impl Component for MockComponent {
    fn parameter_names(&self) -> &[&'static str] {
        &[]
    }

    fn create_endpoint(
        &self,
        params: &EndpointParams,
        _ctx: &ComponentContext,
    ) -> Result<Arc<dyn Endpoint>, EngineError> {
        Ok(Arc::new(MockEndpoint {
            uri: params.uri().to_string(),
            state: Arc::new(MockState::default()),
        }))
    }
}

#[derive(Default)]
struct Expectations {
    count: Option<usize>,
    bodies: Option<Vec<Value>>,
    headers: Vec<(String, Value)>,
}

impl Expectations {
    fn awaited(&self) -> Option<usize> {
        self.count.or_else(|| self.bodies.as_ref().map(Vec::len))
    }
}

#[derive(Default)]
struct MockState {
    received: Mutex<Vec<Exchange>>,
    expectations: Mutex<Expectations>,
    responder: Mutex<Option<Responder>>,
    arrived: Notify,
}

/// Endpoint that records exchanges for assertions in tests.
pub struct MockEndpoint {
    uri: String,
    state: Arc<MockState>,
}

impl MockEndpoint {
    pub fn expect_message_count(&self, count: usize) {
        self.state.expectations.lock().count = Some(count);
    }

    /// Expects exactly these bodies, in order.
    pub fn expect_bodies_received<I, V>(&self, bodies: I)
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.state.expectations.lock().bodies = Some(bodies.into_iter().map(Into::into).collect());
    }

    /// Expects at least one received exchange to carry `key = value`.
    pub fn expect_header_received(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.state
            .expectations
            .lock()
            .headers
            .push((key.into(), value.into()));
    }

    /// Runs `f` on every exchange after it is recorded, e.g. to set a reply.
    pub fn respond_with<F>(&self, f: F)
    where
        F: Fn(&mut Exchange) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        *self.state.responder.lock() = Some(Arc::new(f));
    }

    #[must_use]
    pub fn received_exchanges(&self) -> Vec<Exchange> {
        self.state.received.lock().clone()
    }

    #[must_use]
    pub fn received_bodies(&self) -> Vec<Value> {
        self.state
            .received
            .lock()
            .iter()
            .map(|ex| ex.body().clone())
            .collect()
    }

    #[must_use]
    pub fn received_count(&self) -> usize {
        self.state.received.lock().len()
    }

    /// Waits up to `timeout` for the expected number of exchanges, then
    /// checks every expectation.
    ///
    /// # Errors
    ///
    /// Describes the first expectation that does not hold.
    pub async fn assert_is_satisfied(&self, timeout: Duration) -> anyhow::Result<()> {
        let awaited = self.state.expectations.lock().awaited();
        if let Some(awaited) = awaited {
            let deadline = tokio::time::Instant::now() + timeout;
            loop {
                let arrived = self.state.arrived.notified();
                if self.received_count() >= awaited {
                    break;
                }
                if tokio::time::timeout_at(deadline, arrived).await.is_err() {
                    break;
                }
            }
        }

        let received = self.received_exchanges();
        let expectations = self.state.expectations.lock();
        if let Some(count) = expectations.count {
            anyhow::ensure!(
                received.len() == count,
                "{}: expected {count} exchanges, received {}",
                self.uri,
                received.len()
            );
        }
        if let Some(bodies) = &expectations.bodies {
            let actual: Vec<&Value> = received.iter().map(Exchange::body).collect();
            let expected: Vec<&Value> = bodies.iter().collect();
            anyhow::ensure!(
                actual == expected,
                "{}: expected bodies {expected:?}, received {actual:?}",
                self.uri
            );
        }
        for (key, value) in &expectations.headers {
            anyhow::ensure!(
                received.iter().any(|ex| ex.header(key) == Some(value)),
                "{}: no exchange carried header {key} = {value:?}",
                self.uri
            );
        }
        Ok(())
    }

    /// Forgets received exchanges, expectations, and the responder.
    pub fn reset(&self) {
        self.state.received.lock().clear();
        *self.state.expectations.lock() = Expectations::default();
        self.state.responder.lock().take();
    }
}

impl Endpoint for MockEndpoint {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn create_producer(&self) -> Result<Arc<dyn Producer>, EngineError> {
        Ok(Arc::new(MockProducer {
            uri: self.uri.clone(),
            state: Arc::clone(&self.state),
        }))
    }

    fn create_consumer(&self, _binding: RouteBinding) -> Result<Box<dyn Consumer>, EngineError> {
        Err(unsupported(&self.uri, "consuming"))
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

struct MockProducer {
    uri: String,
    state: Arc<MockState>,
}

#[async_trait]
impl Producer for MockProducer {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), EngineError> {
        self.state.received.lock().push(exchange.clone());
        self.state.arrived.notify_waiters();

        let responder = self.state.responder.lock().clone();
        if let Some(respond) = responder {
            if let Err(err) = respond(exchange) {
                exchange.fail(self.uri.clone(), err);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SwitchyardContext;

    #[tokio::test]
    async fn waits_for_late_arrivals() {
        let ctx = SwitchyardContext::new();
        let mock = ctx.mock("mock:late").unwrap();
        mock.expect_message_count(2);

        let template = ctx.producer_template();
        tokio::spawn(async move {
            for body in ["a", "b"] {
                tokio::time::sleep(Duration::from_millis(20)).await;
                template.send_body("mock:late", body).await.unwrap();
            }
        });
        mock.assert_is_satisfied(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn unmet_expectations_are_described() {
        let ctx = SwitchyardContext::new();
        let mock = ctx.mock("mock:m").unwrap();
        mock.expect_bodies_received(["x", "y"]);
        ctx.producer_template().send_body("mock:m", "x").await.unwrap();

        let err = mock.assert_is_satisfied(Duration::from_millis(30)).await.unwrap_err();
        assert!(err.to_string().contains("expected bodies"));
    }

    #[tokio::test]
    async fn header_expectation() {
        let ctx = SwitchyardContext::new();
        let mock = ctx.mock("mock:h").unwrap();
        mock.expect_header_received("region", "eu");
        ctx.producer_template()
            .send_body_and_headers("mock:h", "x", [("region", "eu")])
            .await
            .unwrap();
        mock.assert_is_satisfied(Duration::ZERO).await.unwrap();
    }

    #[tokio::test]
    async fn responder_shapes_the_reply() {
        let ctx = SwitchyardContext::new();
        let mock = ctx.mock("mock:reply").unwrap();
        mock.respond_with(|ex| {
            ex.set_body("pong");
            Ok(())
        });
        let reply = ctx.producer_template().request_body("mock:reply", "ping").await.unwrap();
        assert_eq!(reply, Value::from("pong"));
        assert_eq!(mock.received_bodies(), vec![Value::from("ping")]);

        mock.reset();
        assert_eq!(mock.received_count(), 0);
    }

    #[tokio::test]
    async fn failing_responder_fails_the_exchange() {
        let ctx = SwitchyardContext::new();
        let mock = ctx.mock("mock:broken").unwrap();
        mock.respond_with(|_| Err(anyhow::anyhow!("down")));
        let err = ctx.producer_template().send_body("mock:broken", "x").await.unwrap_err();
        assert!(matches!(err, EngineError::ProcessingFailed { .. }));
    }

    #[tokio::test]
    async fn mock_cannot_be_a_route_source() {
        let ctx = SwitchyardContext::new();
        ctx.add_routes([crate::route::RouteBuilder::from("mock:x").route_id("r")])
            .await
            .unwrap();
        let err = ctx.start().await.unwrap_err();
        assert!(err.to_string().contains("does not support consuming"));
    }
}
