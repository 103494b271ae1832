use std::sync::Arc;

use async_trait::async_trait;
use switchyard_core::Exchange;
use tokio::sync::Semaphore;

use super::{Pipeline, Processor};

/// Runs nested steps on a spawned task, at most `pool_size` at a time.
///
/// The calling task waits for the spawned one and then continues with its
/// result, so the caller's runtime thread is never blocked.
pub struct Threads {
    name: String,
    steps: Pipeline,
    permits: Arc<Semaphore>,
}

impl Threads {
    #[must_use]
    pub fn new(pool_size: usize, steps: Pipeline) -> Self {
        Self {
            name: format!("threads({pool_size})"),
            steps,
            permits: Arc::new(Semaphore::new(pool_size.max(1))),
        }
    }

    #[must_use]
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

#[async_trait]
impl Processor for Threads {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        let permit = Arc::clone(&self.permits).acquire_owned().await?;
        let steps = self.steps.clone();
        let mut work = exchange.clone();
        let handle = tokio::spawn(async move {
            let _permit = permit;
            steps.run(&mut work).await;
            work
        });
        *exchange = handle.await?;
        Ok(())
    }

    async fn start(&self) -> anyhow::Result<()> {
        self.steps.start().await
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.permits.close();
        self.steps.stop().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use switchyard_core::Value;

    use super::*;
    use crate::processor::testing::exchange;

    struct Gauge {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl Processor for Arc<Gauge> {
        fn name(&self) -> &str {
            "gauge"
        }

        async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            exchange.set_body("done");
            Ok(())
        }
    }

    #[tokio::test]
    async fn pool_bounds_concurrency_and_returns_results() {
        let gauge = Arc::new(Gauge {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let threads = Arc::new(Threads::new(2, Pipeline::new(vec![Arc::new(Arc::clone(&gauge))])));

        let tasks: Vec<_> = (0..6)
            .map(|i| {
                let threads = Arc::clone(&threads);
                tokio::spawn(async move {
                    let mut ex = exchange(i);
                    threads.process(&mut ex).await.unwrap();
                    ex
                })
            })
            .collect();
        for task in tasks {
            assert_eq!(task.await.unwrap().body(), &Value::from("done"));
        }
        assert_eq!(gauge.peak.load(Ordering::SeqCst), 2);
        assert_eq!(threads.available(), 2);
    }

    #[tokio::test]
    async fn stopped_pool_rejects_work() {
        let threads = Threads::new(1, Pipeline::new(vec![]));
        threads.stop().await.unwrap();
        assert!(threads.process(&mut exchange("x")).await.is_err());
    }
}
