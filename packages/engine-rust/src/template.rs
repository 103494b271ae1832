//! Sending exchanges into endpoints from application code.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use switchyard_core::{BodyType, Exchange, ExchangePattern, Message, TypeConverterRegistry, Value};

use crate::context::SwitchyardContext;
use crate::endpoint::{EndpointRegistry, Producer};
use crate::error::EngineError;
use crate::processor::send::send;

/// Sends messages to endpoints by URI.
///
/// Producers are created on first use of a URI and reused afterwards.
/// Request-reply calls are bounded by the exchange's timeout or the
/// context's default request timeout.
#[derive(Clone)]
pub struct ProducerTemplate {
    endpoints: Arc<EndpointRegistry>,
    converters: Arc<TypeConverterRegistry>,
    producers: Arc<DashMap<String, Arc<dyn Producer>>>,
    default_timeout: Duration,
}

impl ProducerTemplate {
    #[must_use]
    pub fn new(ctx: &SwitchyardContext) -> Self {
        Self {
            endpoints: Arc::clone(ctx.endpoints()),
            converters: Arc::clone(ctx.converters()),
            producers: Arc::new(DashMap::new()),
            default_timeout: ctx.config().default_request_timeout(),
        }
    }

    /// Overrides the request-reply timeout used when an exchange has none.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    fn producer(&self, uri: &str) -> Result<Arc<dyn Producer>, EngineError> {
        if let Some(cached) = self.producers.get(uri) {
            return Ok(Arc::clone(cached.value()));
        }
        let producer = self.endpoints.resolve(uri)?.create_producer()?;
        self.producers.insert(uri.to_string(), Arc::clone(&producer));
        Ok(producer)
    }

    #[must_use]
    pub fn new_exchange(&self, pattern: ExchangePattern, message: Message) -> Exchange {
        Exchange::with_message(Arc::clone(&self.converters), pattern, message)
    }

    /// Sends `exchange` to `uri` and returns it once the endpoint is done.
    ///
    /// # Errors
    ///
    /// Transport errors, [`EngineError::ExchangeTimedOut`], or
    /// [`EngineError::ProcessingFailed`] when the exchange came back failed.
    pub async fn send(&self, uri: &str, mut exchange: Exchange) -> Result<Exchange, EngineError> {
        let producer = self.producer(uri)?;
        send(producer.as_ref(), &mut exchange, self.default_timeout).await?;
        exchange.promote_out();
        match exchange.take_failure() {
            Some(failure) => {
                let route_id = exchange.route_id().unwrap_or(uri).to_string();
                Err(EngineError::processing_failed(route_id, exchange.id(), failure))
            }
            None => Ok(exchange),
        }
    }

    /// Like [`send`](Self::send) with the request-reply pattern.
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub async fn request(&self, uri: &str, mut exchange: Exchange) -> Result<Exchange, EngineError> {
        exchange.set_pattern(ExchangePattern::InOut);
        self.send(uri, exchange).await
    }

    /// Fire-and-forget send of a body.
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub async fn send_body(&self, uri: &str, body: impl Into<Value>) -> Result<(), EngineError> {
        self.send(uri, self.new_exchange(ExchangePattern::InOnly, Message::new(body)))
            .await
            .map(drop)
    }

    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub async fn send_body_and_headers<I, K, V>(
        &self,
        uri: &str,
        body: impl Into<Value>,
        headers: I,
    ) -> Result<(), EngineError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        let message = headers
            .into_iter()
            .fold(Message::new(body), |message, (k, v)| message.with_header(k, v));
        self.send(uri, self.new_exchange(ExchangePattern::InOnly, message))
            .await
            .map(drop)
    }

    /// Request-reply with a body; returns the reply body.
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub async fn request_body(&self, uri: &str, body: impl Into<Value>) -> Result<Value, EngineError> {
        let reply = self
            .send(uri, self.new_exchange(ExchangePattern::InOut, Message::new(body)))
            .await?;
        Ok(reply.into_message().take_body())
    }

    /// Request-reply converting the reply body to `T`.
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send); also fails when the reply cannot be
    /// converted.
    pub async fn request_body_as<T: BodyType>(
        &self,
        uri: &str,
        body: impl Into<Value>,
    ) -> Result<Option<T>, EngineError> {
        let reply = self
            .send(uri, self.new_exchange(ExchangePattern::InOut, Message::new(body)))
            .await?;
        Ok(reply.body_as::<T>()?)
    }
}

impl std::fmt::Debug for ProducerTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerTemplate")
            .field("producers", &self.producers.len())
            .field("default_timeout", &self.default_timeout)
            .finish_non_exhaustive()
    }
}
