//! Error taxonomy for endpoint resolution, routing, and route lifecycle.

use switchyard_core::{ConvertError, ExchangeFailure, RegistryError, UriError};

use crate::route::RouteStatus;

/// Errors returned by the engine.
///
/// Step-level failures are carried on the exchange and only surface here as
/// [`EngineError::ProcessingFailed`] when nothing in the route handled them.
/// Lifecycle errors (`RouteStart`, `RouteStop`) are always returned
/// synchronously to the caller of the lifecycle operation.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Conversion(#[from] ConvertError),
    #[error("invalid endpoint uri: {0}")]
    InvalidUri(#[from] UriError),
    #[error("no component registered for scheme `{scheme}` (uri `{uri}`)")]
    NoSuchEndpointComponent { scheme: String, uri: String },
    #[error("unknown parameter `{param}` for endpoint `{uri}`")]
    UnknownParameter { uri: String, param: String },
    #[error("invalid value `{value}` for parameter `{param}` of endpoint `{uri}`")]
    InvalidParameterValue {
        uri: String,
        param: String,
        value: String,
    },
    #[error("property placeholder `{key}` could not be resolved")]
    MissingProperty { key: String },
    #[error("invalid endpoint `{uri}`: {reason}")]
    InvalidEndpoint { uri: String, reason: String },
    #[error("endpoint `{uri}` does not support {operation}")]
    UnsupportedOperation {
        uri: String,
        operation: &'static str,
    },
    #[error("no consumer available on endpoint `{uri}`")]
    DirectConsumerNotAvailable { uri: String },
    #[error("queue `{queue}` is full")]
    QueueFull { queue: String },
    #[error("exchange {exchange_id} timed out after {timeout_ms}ms")]
    ExchangeTimedOut { exchange_id: String, timeout_ms: u64 },
    #[error("processing failed in route `{route_id}` for exchange {exchange_id}: {failure}")]
    ProcessingFailed {
        route_id: String,
        exchange_id: String,
        #[source]
        failure: ExchangeFailure,
    },
    #[error("failed to start route `{route_id}`: {source:#}")]
    RouteStart {
        route_id: String,
        source: anyhow::Error,
    },
    #[error("failed to stop route `{route_id}`: {source:#}")]
    RouteStop {
        route_id: String,
        source: anyhow::Error,
    },
    #[error("cannot {operation} route `{route_id}` while it is {status}")]
    InvalidTransition {
        route_id: String,
        status: RouteStatus,
        operation: &'static str,
    },
    #[error("route `{route_id}` is not accepting exchanges while {status}")]
    RouteNotAccepting {
        route_id: String,
        status: RouteStatus,
    },
    #[error("route id `{0}` is already in use")]
    DuplicateRouteId(String),
    #[error("no route with id `{0}`")]
    NoSuchRoute(String),
    #[error("invalid route `{route_id}`: {reason}")]
    InvalidRoute { route_id: String, reason: String },
    #[error("no bean named `{0}`")]
    NoSuchBean(String),
    #[error("bean `{bean}` has no method `{method}`")]
    NoSuchBeanMethod { bean: String, method: String },
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("internal error: {0:#}")]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    /// Wraps a failure left on an exchange at the end of routing.
    #[must_use]
    pub fn processing_failed(
        route_id: impl Into<String>,
        exchange_id: impl Into<String>,
        failure: ExchangeFailure,
    ) -> Self {
        EngineError::ProcessingFailed {
            route_id: route_id.into(),
            exchange_id: exchange_id.into(),
            failure,
        }
    }

    pub(crate) fn invalid_endpoint(uri: &str, reason: impl Into<String>) -> Self {
        EngineError::InvalidEndpoint {
            uri: uri.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_route(route_id: &str, reason: impl Into<String>) -> Self {
        EngineError::InvalidRoute {
            route_id: route_id.to_string(),
            reason: reason.into(),
        }
    }
}
