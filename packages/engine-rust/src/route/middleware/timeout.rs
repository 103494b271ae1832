//! Timeout middleware for request-reply exchanges.
//!
//! `InOut` exchanges that take longer than their own timeout (or the route
//! default) fail with `EngineError::ExchangeTimedOut`; the inner future is
//! dropped. Fire-and-forget exchanges are not bounded here.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use switchyard_core::{Exchange, ExchangePattern};
use tower::{Layer, Service};

use crate::error::EngineError;
use crate::route::RouteStats;

// ---------------------------------------------------------------------------
// TimeoutLayer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TimeoutLayer {
    default_timeout: Duration,
    stats: Arc<RouteStats>,
}

impl TimeoutLayer {
    #[must_use]
    pub fn new(default_timeout: Duration, stats: Arc<RouteStats>) -> Self {
        Self {
            default_timeout,
            stats,
        }
    }
}

impl<S> Layer<S> for TimeoutLayer {
    type Service = TimeoutService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TimeoutService {
            inner,
            default_timeout: self.default_timeout,
            stats: Arc::clone(&self.stats),
        }
    }
}

// ---------------------------------------------------------------------------
// TimeoutService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TimeoutService<S> {
    inner: S,
    default_timeout: Duration,
    stats: Arc<RouteStats>,
}

impl<S> Service<Exchange> for TimeoutService<S>
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
        if exchange.pattern() != ExchangePattern::InOut {
            return Box::pin(self.inner.call(exchange));
        }

        let timeout = exchange.timeout().unwrap_or(self.default_timeout);
        let exchange_id = exchange.id().to_string();
        let stats = Arc::clone(&self.stats);
        let fut = self.inner.call(exchange);
        Box::pin(async move {
            match tokio::time::timeout(timeout, fut).await {
                Ok(result) => result,
                Err(_elapsed) => {
                    stats.record_failed();
                    Err(EngineError::ExchangeTimedOut {
                        exchange_id,
                        timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    })
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
