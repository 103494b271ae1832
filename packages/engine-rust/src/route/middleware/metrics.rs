//! Metrics middleware for routes.
//!
//! Wraps each exchange in an `exchange` span, feeds the `metrics` recorder,
//! and updates the route's in-process [`RouteStats`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use switchyard_core::Exchange;
use tower::{Layer, Service};
use tracing::{info_span, Instrument};

use crate::error::EngineError;
use crate::route::RouteStats;

// ---------------------------------------------------------------------------
// MetricsLayer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MetricsLayer {
    route_id: Arc<str>,
    stats: Arc<RouteStats>,
}

impl MetricsLayer {
    #[must_use]
    pub fn new(route_id: &str, stats: Arc<RouteStats>) -> Self {
        Self {
            route_id: route_id.into(),
            stats,
        }
    }
}

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService {
            inner,
            route_id: Arc::clone(&self.route_id),
            stats: Arc::clone(&self.stats),
        }
    }
}

// ---------------------------------------------------------------------------
// MetricsService
// ---------------------------------------------------------------------------

/// Records exchange duration and outcome.
#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
    route_id: Arc<str>,
    stats: Arc<RouteStats>,
}

impl<S> Service<Exchange> for MetricsService<S>
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
        let route_id = self.route_id.to_string();
        let span = info_span!(
            "exchange",
            route = %route_id,
            exchange_id = exchange.id(),
            pattern = ?exchange.pattern(),
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        self.stats.record_received();
        metrics::counter!("switchyard_exchanges_total", "route" => route_id.clone()).increment(1);

        let stats = Arc::clone(&self.stats);
        let fut = self.inner.call(exchange);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;
                let elapsed = start.elapsed();

                let outcome = match &result {
                    Ok(done) if !done.is_failed() => "ok",
                    Ok(_) => "failed",
                    Err(_) => "error",
                };
                if outcome == "ok" {
                    stats.record_completed();
                } else {
                    stats.record_failed();
                    metrics::counter!("switchyard_exchanges_failed_total", "route" => route_id.clone())
                        .increment(1);
                }
                metrics::histogram!("switchyard_exchange_duration_ms", "route" => route_id.clone())
                    .record(elapsed.as_secs_f64() * 1_000.0);

                let duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
                tracing::Span::current().record("duration_ms", duration_ms);
                tracing::Span::current().record("outcome", outcome);
                tracing::debug!(route = %route_id, duration_ms, outcome, "exchange complete");

                result
            }
            .instrument(span),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
