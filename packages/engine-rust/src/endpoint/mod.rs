//! Component/endpoint SPI.
//!
//! A [`Component`] is registered under a URI scheme and acts as a factory for
//! [`Endpoint`]s. An endpoint creates [`Producer`]s (send exchanges to it)
//! and [`Consumer`]s (feed exchanges from it into a route through a
//! [`RouteBinding`]).

pub mod registry;

use std::any::Any;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use switchyard_core::{EndpointUri, Exchange, ExchangePattern, Message, TypeConverterRegistry};

use crate::bean::BeanRegistry;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::registry::Registry;
use crate::route::HealthReporter;

pub use registry::EndpointRegistry;

// ---------------------------------------------------------------------------
// ComponentContext / EndpointParams
// ---------------------------------------------------------------------------

/// Shared context services handed to components when creating endpoints.
#[derive(Debug, Clone)]
pub struct ComponentContext {
    pub converters: Arc<TypeConverterRegistry>,
    pub registry: Arc<Registry>,
    pub beans: Arc<BeanRegistry>,
    pub config: Arc<EngineConfig>,
}

/// A parsed endpoint URI with typed parameter accessors.
#[derive(Debug, Clone)]
pub struct EndpointParams {
    uri: EndpointUri,
    normalized: String,
}

impl EndpointParams {
    #[must_use]
    pub fn new(uri: EndpointUri) -> Self {
        let normalized = uri.normalized();
        Self { uri, normalized }
    }

    /// Normalized URI; the interning key of the endpoint.
    #[must_use]
    pub fn uri(&self) -> &str {
        &self.normalized
    }

    #[must_use]
    pub fn path(&self) -> &str {
        self.uri.path()
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.uri.param(key)
    }

    /// Parses a parameter, if present.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidParameterValue`] when the value does not parse.
    pub fn parse<T: FromStr>(&self, key: &str) -> Result<Option<T>, EngineError> {
        self.uri
            .param(key)
            .map(|raw| {
                raw.trim().parse::<T>().map_err(|_| EngineError::InvalidParameterValue {
                    uri: self.normalized.clone(),
                    param: key.to_string(),
                    value: raw.to_string(),
                })
            })
            .transpose()
    }

    /// Parses a parameter, falling back to `default`.
    ///
    /// # Errors
    ///
    /// See [`parse`](Self::parse).
    pub fn parse_or<T: FromStr>(&self, key: &str, default: T) -> Result<T, EngineError> {
        Ok(self.parse(key)?.unwrap_or(default))
    }

    /// Reads a boolean flag. A bare key (`?showHeaders`) means `true`.
    ///
    /// # Errors
    ///
    /// See [`parse`](Self::parse).
    pub fn flag(&self, key: &str, default: bool) -> Result<bool, EngineError> {
        match self.uri.param(key) {
            Some("") => Ok(true),
            Some(_) => self.parse_or(key, default),
            None => Ok(default),
        }
    }

    /// Reads a millisecond parameter as a [`Duration`].
    ///
    /// # Errors
    ///
    /// See [`parse`](Self::parse).
    pub fn millis(&self, key: &str, default_ms: u64) -> Result<Duration, EngineError> {
        self.parse_or(key, default_ms).map(Duration::from_millis)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.uri.params().keys().map(String::as_str)
    }
}

// ---------------------------------------------------------------------------
// SPI traits
// ---------------------------------------------------------------------------

/// Factory for endpoints of one URI scheme.
#[async_trait]
pub trait Component: Send + Sync {
    /// Parameters this component understands. Unknown parameters fail
    /// endpoint validation unless [`lenient_parameters`](Self::lenient_parameters)
    /// is set.
    fn parameter_names(&self) -> &[&'static str];

    fn lenient_parameters(&self) -> bool {
        false
    }

    /// Creates the endpoint for `params`.
    ///
    /// Called at most once per normalized URI; it must not resolve other
    /// endpoints through the registry.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid parameter values or a context path the
    /// component cannot use.
    fn create_endpoint(
        &self,
        params: &EndpointParams,
        ctx: &ComponentContext,
    ) -> Result<Arc<dyn Endpoint>, EngineError>;

    /// Releases component-wide resources when the context stops.
    async fn shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// An addressable source and/or destination of exchanges.
pub trait Endpoint: Send + Sync + 'static {
    /// The normalized URI.
    fn uri(&self) -> &str;

    /// # Errors
    ///
    /// Returns [`EngineError::UnsupportedOperation`] for consume-only endpoints.
    fn create_producer(&self) -> Result<Arc<dyn Producer>, EngineError>;

    /// # Errors
    ///
    /// Returns [`EngineError::UnsupportedOperation`] for produce-only endpoints.
    fn create_consumer(&self, binding: RouteBinding) -> Result<Box<dyn Consumer>, EngineError>;

    /// Upcast used to recover the concrete endpoint type.
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Sends exchanges to an endpoint.
#[async_trait]
pub trait Producer: Send + Sync {
    /// Delivers the exchange. For request-reply the reply replaces the
    /// exchange's message (or is set as its out message).
    ///
    /// # Errors
    ///
    /// Returns transport-level failures; failures raised by a downstream
    /// route are carried on the exchange instead.
    async fn process(&self, exchange: &mut Exchange) -> Result<(), EngineError>;
}

/// Feeds exchanges from an endpoint into a route.
#[async_trait]
pub trait Consumer: Send + Sync {
    async fn start(&self) -> anyhow::Result<()>;

    /// Stops delivering. Exchanges already handed to the route keep running.
    async fn stop(&self) -> anyhow::Result<()>;

    /// Whether [`suspend`](Self::suspend) keeps the consumer's resources
    /// alive. Routes whose consumer does not support it are suspended by
    /// stopping the consumer instead.
    fn supports_suspension(&self) -> bool {
        false
    }

    async fn suspend(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn resume(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Runs an exchange through a route.
#[async_trait]
pub trait ExchangeHandler: Send + Sync {
    /// # Errors
    ///
    /// Returns an error when the route refused or timed out the exchange.
    /// Step failures come back on the returned exchange.
    async fn handle(&self, exchange: Exchange) -> Result<Exchange, EngineError>;
}

/// What a consumer needs to deliver into its route.
#[derive(Clone)]
pub struct RouteBinding {
    pub route_id: String,
    pub handler: Arc<dyn ExchangeHandler>,
    pub health: Arc<HealthReporter>,
    pub converters: Arc<TypeConverterRegistry>,
}

impl RouteBinding {
    #[must_use]
    pub fn new_exchange(&self, pattern: ExchangePattern, message: Message) -> Exchange {
        Exchange::with_message(Arc::clone(&self.converters), pattern, message)
    }

    /// Hands an exchange to the route.
    ///
    /// # Errors
    ///
    /// See [`ExchangeHandler::handle`].
    pub async fn deliver(&self, exchange: Exchange) -> Result<Exchange, EngineError> {
        self.handler.handle(exchange).await
    }

    /// Delivers a fire-and-forget exchange, logging anything that went
    /// wrong. Returns whether the route accepted and completed it.
    pub async fn deliver_logged(&self, exchange: Exchange) -> bool {
        let exchange_id = exchange.id().to_string();
        match self.deliver(exchange).await {
            Ok(done) => !done.is_failed(),
            Err(err) => {
                tracing::warn!(
                    route_id = %self.route_id,
                    exchange_id = %exchange_id,
                    error = %err,
                    "route did not accept exchange"
                );
                false
            }
        }
    }
}

impl std::fmt::Debug for RouteBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteBinding")
            .field("route_id", &self.route_id)
            .finish_non_exhaustive()
    }
}

/// Sends `exchange` on a spawned task, returning a handle to the completed
/// exchange.
pub fn process_async(
    producer: Arc<dyn Producer>,
    mut exchange: Exchange,
) -> tokio::task::JoinHandle<Result<Exchange, EngineError>> {
    tokio::spawn(async move {
        producer.process(&mut exchange).await?;
        Ok(exchange)
    })
}

pub(crate) fn unsupported(uri: &str, operation: &'static str) -> EngineError {
    EngineError::UnsupportedOperation {
        uri: uri.to_string(),
        operation,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(uri: &str) -> EndpointParams {
        EndpointParams::new(EndpointUri::parse(uri).unwrap())
    }

    #[test]
    fn typed_parameter_access() {
        let p = params("seda:orders?size=5&blockWhenFull&timeout=250");
        assert_eq!(p.path(), "orders");
        assert_eq!(p.parse_or::<usize>("size", 1).unwrap(), 5);
        assert_eq!(p.parse_or::<usize>("concurrentConsumers", 1).unwrap(), 1);
        assert!(p.flag("blockWhenFull", false).unwrap());
        assert_eq!(p.millis("timeout", 30_000).unwrap(), Duration::from_millis(250));
    }

    #[test]
    fn bad_values_name_the_parameter() {
        let p = params("timer:t?period=soon");
        let err = p.millis("period", 1000).unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidParameterValue { ref param, ref value, .. }
                if param == "period" && value == "soon"
        ));
    }
}
