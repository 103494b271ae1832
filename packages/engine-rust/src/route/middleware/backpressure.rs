//! Backpressure middleware for routes.
//!
//! Bounds the number of exchanges a route processes concurrently. When the
//! bound is reached, exchanges either wait for a slot or are rejected with
//! `EngineError::QueueFull`, depending on [`BackpressureMode`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use switchyard_core::Exchange;
use tokio::sync::Semaphore;
use tower::{Layer, Service, ServiceExt};

use crate::config::BackpressureMode;
use crate::error::EngineError;

// ---------------------------------------------------------------------------
// BackpressureLayer
// ---------------------------------------------------------------------------

/// Tower layer that limits concurrent exchanges via a semaphore.
#[derive(Debug, Clone)]
pub struct BackpressureLayer {
    route_id: Arc<str>,
    semaphore: Arc<Semaphore>,
    mode: BackpressureMode,
}

impl BackpressureLayer {
    #[must_use]
    pub fn new(route_id: &str, max_concurrent: u32, mode: BackpressureMode) -> Self {
        Self {
            route_id: route_id.into(),
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1) as usize)),
            mode,
        }
    }
}

impl<S> Layer<S> for BackpressureLayer {
    type Service = BackpressureService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        BackpressureService {
            inner,
            route_id: Arc::clone(&self.route_id),
            semaphore: Arc::clone(&self.semaphore),
            mode: self.mode,
        }
    }
}

// ---------------------------------------------------------------------------
// BackpressureService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct BackpressureService<S> {
    inner: S,
    route_id: Arc<str>,
    semaphore: Arc<Semaphore>,
    mode: BackpressureMode,
}

impl<S> Service<Exchange> for BackpressureService<S>
where
    S: Service<Exchange, Response = Exchange, Error = EngineError> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Exchange;
    type Error = EngineError;
    type Future = Pin<Box<dyn Future<Output = Result<Exchange, EngineError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, exchange: Exchange) -> Self::Future {
        match self.mode {
            BackpressureMode::Reject => {
                let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() else {
                    metrics::counter!("switchyard_exchanges_rejected_total", "route" => self.route_id.to_string())
                        .increment(1);
                    let queue = self.route_id.to_string();
                    return Box::pin(async move { Err(EngineError::QueueFull { queue }) });
                };
                let fut = self.inner.call(exchange);
                Box::pin(async move {
                    let result = fut.await;
                    drop(permit);
                    result
                })
            }
            BackpressureMode::Wait => {
                // The inner service is only called once a slot is free, so
                // waiting exchanges do not count as running. The clone has
                // not been polled, so it is driven to readiness first.
                let semaphore = Arc::clone(&self.semaphore);
                let mut inner = self.inner.clone();
                Box::pin(async move {
                    let permit = semaphore
                        .acquire_owned()
                        .await
                        .map_err(|err| EngineError::Internal(err.into()))?;
                    let result = match inner.ready().await {
                        Ok(ready) => ready.call(exchange).await,
                        Err(err) => Err(err),
                    };
                    drop(permit);
                    result
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::processor::testing::exchange;
    use crate::route::middleware::testing::SlowService;

    #[tokio::test]
    async fn rejects_when_saturated() {
        let layer = BackpressureLayer::new("orders", 1, BackpressureMode::Reject);
        let mut svc = layer.layer(SlowService::new(200));

        let _ = ServiceExt::ready(&mut svc).await.unwrap();
        let in_flight = tokio::spawn(svc.call(exchange("first")));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = svc.call(exchange("second")).await.unwrap_err();
        assert!(matches!(err, EngineError::QueueFull { ref queue } if queue == "orders"));
        in_flight.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn waits_for_a_slot_by_default() {
        let layer = BackpressureLayer::new("orders", 1, BackpressureMode::Wait);
        let svc = layer.layer(SlowService::new(40));

        let started = Instant::now();
        let first = tokio::spawn(svc.clone().oneshot(exchange("a")));
        let second = tokio::spawn(svc.oneshot(exchange("b")));
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();
        assert!(started.elapsed() >= Duration::from_millis(80));
    }

    /// Fails any call that was not preceded by a successful `poll_ready`
    /// on the same handle. Clones start out not ready.
    #[derive(Debug, Default)]
    struct ReadinessChecked {
        ready: bool,
    }

    impl Clone for ReadinessChecked {
        fn clone(&self) -> Self {
            Self::default()
        }
    }

    impl Service<Exchange> for ReadinessChecked {
        type Response = Exchange;
        type Error = EngineError;
        type Future = Pin<Box<dyn Future<Output = Result<Exchange, EngineError>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            self.ready = true;
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, exchange: Exchange) -> Self::Future {
            let was_ready = std::mem::take(&mut self.ready);
            Box::pin(async move {
                if was_ready {
                    Ok(exchange)
                } else {
                    Err(EngineError::Internal(anyhow::anyhow!("called before poll_ready")))
                }
            })
        }
    }

    #[tokio::test]
    async fn waiting_drives_the_inner_service_to_readiness() {
        let layer = BackpressureLayer::new("orders", 1, BackpressureMode::Wait);
        let svc = layer.layer(ReadinessChecked::default());

        svc.clone().oneshot(exchange("a")).await.unwrap();
        svc.oneshot(exchange("b")).await.unwrap();
    }
}
