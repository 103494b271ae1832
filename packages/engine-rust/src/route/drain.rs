//! In-flight exchange tracking for draining a route before it stops.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Counts exchanges currently inside a route.
///
/// The route handler takes a guard for every admitted exchange; stopping a
/// route stops its consumer first and then waits for the count to reach zero.
#[derive(Debug, Default)]
pub struct InFlightTracker {
    in_flight: Arc<AtomicU64>,
}

impl InFlightTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an RAII guard that tracks one in-flight exchange.
    ///
    /// The counter is decremented when the guard is dropped, including when
    /// the exchange's future is cancelled.
    #[must_use]
    pub fn guard(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Waits for all in-flight exchanges to complete, up to `timeout`.
    ///
    /// Returns `false` if exchanges were still running when the timeout
    /// expired.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self.in_flight.load(Ordering::Relaxed) == 0 {
                return true;
            }

            if tokio::time::Instant::now() >= deadline {
                return false;
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// Decrements the in-flight counter when dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guards_increment_and_decrement() {
        let tracker = InFlightTracker::new();
        let first = tracker.guard();
        let second = tracker.guard();
        assert_eq!(tracker.count(), 2);
        drop(first);
        assert_eq!(tracker.count(), 1);
        drop(second);
        assert_eq!(tracker.count(), 0);
    }

    #[tokio::test]
    async fn drain_succeeds_once_guards_are_released() {
        let tracker = Arc::new(InFlightTracker::new());
        let guard = tracker.guard();
        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            drop(guard);
        });

        assert!(tracker.wait_for_drain(Duration::from_secs(2)).await);
        release.await.unwrap();
    }

    #[tokio::test]
    async fn drain_times_out_with_stuck_exchange() {
        let tracker = InFlightTracker::new();
        let _stuck = tracker.guard();
        assert!(!tracker.wait_for_drain(Duration::from_millis(50)).await);
        assert_eq!(tracker.count(), 1);
    }
}
