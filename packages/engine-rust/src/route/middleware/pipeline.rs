//! Composes the middleware layers around a route's processing service.

use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use parking_lot::Mutex;
use switchyard_core::Exchange;
use tower::util::BoxCloneService;
use tower::{Service, ServiceBuilder, ServiceExt};

use super::admission::AdmissionLayer;
use super::backpressure::BackpressureLayer;
use super::metrics::MetricsLayer;
use super::timeout::TimeoutLayer;
use crate::config::EngineConfig;
use crate::endpoint::ExchangeHandler;
use crate::error::EngineError;
use crate::route::drain::InFlightTracker;
use crate::route::{RouteStats, RouteStatus};

/// Route state the middleware reads and updates.
#[derive(Debug, Clone)]
pub struct RouteState {
    pub route_id: String,
    pub status: Arc<ArcSwap<RouteStatus>>,
    pub in_flight: Arc<InFlightTracker>,
    pub stats: Arc<RouteStats>,
}

/// Build the route's processing stack by wrapping `service` with middleware.
///
/// Layer order (outermost to innermost):
/// 1. `AdmissionLayer` -- reject unless the route is accepting
/// 2. `BackpressureLayer` -- bound concurrent exchanges
/// 3. `TimeoutLayer` -- enforce request-reply timeouts
/// 4. `MetricsLayer` -- record timing and outcome (closest to the pipeline)
#[must_use]
pub fn build_route_service<S>(service: S, state: &RouteState, config: &EngineConfig) -> RouteHandler
where
    S: Service<Exchange, Response = Exchange, Error = EngineError> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    let stack = ServiceBuilder::new()
        .layer(AdmissionLayer::new(
            &state.route_id,
            Arc::clone(&state.status),
            Arc::clone(&state.in_flight),
        ))
        .layer(BackpressureLayer::new(
            &state.route_id,
            config.max_concurrent_exchanges_per_route,
            config.backpressure,
        ))
        .layer(TimeoutLayer::new(
            config.default_request_timeout(),
            Arc::clone(&state.stats),
        ))
        .layer(MetricsLayer::new(&state.route_id, Arc::clone(&state.stats)))
        .service(service);

    RouteHandler {
        route_id: state.route_id.clone(),
        service: Mutex::new(BoxCloneService::new(stack)),
    }
}

/// The [`ExchangeHandler`] consumers deliver into.
pub struct RouteHandler {
    route_id: String,
    service: Mutex<BoxCloneService<Exchange, Exchange, EngineError>>,
}

impl RouteHandler {
    #[must_use]
    pub fn route_id(&self) -> &str {
        &self.route_id
    }
}

#[async_trait]
impl ExchangeHandler for RouteHandler {
    async fn handle(&self, exchange: Exchange) -> Result<Exchange, EngineError> {
        let service = self.service.lock().clone();
        service.oneshot(exchange).await
    }
}

impl std::fmt::Debug for RouteHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteHandler")
            .field("route_id", &self.route_id)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
