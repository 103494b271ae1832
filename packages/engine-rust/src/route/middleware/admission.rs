//! Admission middleware for routes.
//!
//! Rejects exchanges with `EngineError::RouteNotAccepting` unless the route
//! is in an accepting state, and tracks every admitted exchange as in flight.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use arc_swap::ArcSwap;
use switchyard_core::Exchange;
use tower::{Layer, Service};

use crate::error::EngineError;
use crate::route::drain::InFlightTracker;
use crate::route::RouteStatus;

// ---------------------------------------------------------------------------
// AdmissionLayer
// ---------------------------------------------------------------------------

/// Tower layer that gates a route on its lifecycle status.
#[derive(Debug, Clone)]
pub struct AdmissionLayer {
    route_id: Arc<str>,
    status: Arc<ArcSwap<RouteStatus>>,
    in_flight: Arc<InFlightTracker>,
}

impl AdmissionLayer {
    #[must_use]
    pub fn new(
        route_id: &str,
        status: Arc<ArcSwap<RouteStatus>>,
        in_flight: Arc<InFlightTracker>,
    ) -> Self {
        Self {
            route_id: route_id.into(),
            status,
            in_flight,
        }
    }
}

impl<S> Layer<S> for AdmissionLayer {
    type Service = AdmissionService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AdmissionService {
            inner,
            route_id: Arc::clone(&self.route_id),
            status: Arc::clone(&self.status),
            in_flight: Arc::clone(&self.in_flight),
        }
    }
}

// ---------------------------------------------------------------------------
// AdmissionService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AdmissionService<S> {
    inner: S,
    route_id: Arc<str>,
    status: Arc<ArcSwap<RouteStatus>>,
    in_flight: Arc<InFlightTracker>,
}

impl<S> Service<Exchange> for AdmissionService<S>
where
    S: Service<Exchange, Response = Exchange, Error = EngineError> + Send,
    S::Future: Send + 'static,
{
    type Response = Exchange;
    type Error = EngineError;
    type Future = Pin<Box<dyn Future<Output = Result<Exchange, EngineError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, exchange: Exchange) -> Self::Future {
        let status = **self.status.load();
        if !status.is_accepting() {
            let route_id = self.route_id.to_string();
            return Box::pin(async move { Err(EngineError::RouteNotAccepting { route_id, status }) });
        }

        let guard = self.in_flight.guard();
        let fut = self.inner.call(exchange);
        Box::pin(async move {
            let result = fut.await;
            drop(guard);
            result
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tower::ServiceExt;

    use super::*;
    use crate::processor::testing::exchange;
    use crate::route::middleware::testing::SlowService;

    #[tokio::test]
    async fn rejects_when_route_is_suspended() {
        let status = Arc::new(ArcSwap::from_pointee(RouteStatus::Suspended));
        let layer = AdmissionLayer::new("orders", status, Arc::new(InFlightTracker::new()));
        let svc = layer.layer(SlowService::new(0));

        let err = svc.oneshot(exchange("x")).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::RouteNotAccepting { ref route_id, status: RouteStatus::Suspended }
                if route_id == "orders"
        ));
    }

    #[tokio::test]
    async fn tracks_in_flight_exchanges() {
        let status = Arc::new(ArcSwap::from_pointee(RouteStatus::Started));
        let tracker = Arc::new(InFlightTracker::new());
        let layer = AdmissionLayer::new("orders", status, Arc::clone(&tracker));
        let svc = layer.layer(SlowService::new(50));

        let running = tokio::spawn(svc.oneshot(exchange("x")));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(tracker.count(), 1);
        running.await.unwrap().unwrap();
        assert_eq!(tracker.count(), 0);
    }
}
