//! Routes: definition, DSL, assembly, and lifecycle.
//!
//! - [`builder`]: the fluent DSL producing immutable [`RouteDefinition`]s
//! - [`definition`]: the step tree a route is built from
//! - [`assembler`]: turns a definition into running processors and a handler
//! - [`controller`]: per-route lifecycle state machine
//! - [`drain`]: in-flight tracking used to drain a route before it stops
//! - [`middleware`]: the tower stack every exchange passes through

pub mod assembler;
pub mod builder;
pub mod controller;
pub mod definition;
pub mod drain;
pub mod middleware;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;

pub use builder::{ChoiceBlock, RouteBuilder, Steps, StepsDsl, TryBlock};
pub use controller::ManagedRoute;
pub use definition::{
    AggregateDef, ErrorHandlerDef, MulticastDef, RecipientListDef, RedeliveryPolicy,
    RouteDefinition, SplitDef, StepDef, StrategyRef,
};

// ---------------------------------------------------------------------------
// RouteStatus
// ---------------------------------------------------------------------------

/// Lifecycle state of a route.
///
/// ```text
/// Stopped -> Starting -> Started -> Suspending -> Suspended -> Resuming -> Started
///                        Started|Suspended -> Stopping -> Stopped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteStatus {
    Stopped,
    Starting,
    Started,
    Suspending,
    Suspended,
    Resuming,
    Stopping,
}

impl RouteStatus {
    /// Whether the route admits new exchanges in this state.
    ///
    /// `Starting` and `Resuming` admit because a consumer may deliver before
    /// the transition is recorded as finished.
    #[must_use]
    pub fn is_accepting(self) -> bool {
        matches!(
            self,
            RouteStatus::Starting | RouteStatus::Started | RouteStatus::Resuming
        )
    }
}

impl fmt::Display for RouteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RouteStatus::Stopped => "stopped",
            RouteStatus::Starting => "starting",
            RouteStatus::Started => "started",
            RouteStatus::Suspending => "suspending",
            RouteStatus::Suspended => "suspended",
            RouteStatus::Resuming => "resuming",
            RouteStatus::Stopping => "stopping",
        })
    }
}

// ---------------------------------------------------------------------------
// RouteHealth
// ---------------------------------------------------------------------------

/// Health of a route's source, as reported by its consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteHealth {
    Up,
    Down { reason: String },
}

/// Shared health cell a consumer reports into.
#[derive(Debug)]
pub struct HealthReporter {
    route_id: String,
    state: ArcSwap<RouteHealth>,
}

impl HealthReporter {
    #[must_use]
    pub fn new(route_id: impl Into<String>) -> Self {
        Self {
            route_id: route_id.into(),
            state: ArcSwap::from_pointee(RouteHealth::Up),
        }
    }

    #[must_use]
    pub fn current(&self) -> RouteHealth {
        (**self.state.load()).clone()
    }

    pub fn report_up(&self) {
        if matches!(**self.state.load(), RouteHealth::Down { .. }) {
            tracing::info!(route_id = %self.route_id, "route source recovered");
            self.state.store(Arc::new(RouteHealth::Up));
        }
    }

    pub fn report_down(&self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::warn!(route_id = %self.route_id, %reason, "route source is down");
        self.state.store(Arc::new(RouteHealth::Down { reason }));
    }
}

// ---------------------------------------------------------------------------
// RouteStats
// ---------------------------------------------------------------------------

/// Per-route exchange counters.
#[derive(Debug, Default)]
pub struct RouteStats {
    total: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time copy of [`RouteStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RouteStatsSnapshot {
    /// Exchanges admitted into the route.
    pub total: u64,
    /// Exchanges that finished without a failure.
    pub completed: u64,
    /// Exchanges that finished with a failure or timed out.
    pub failed: u64,
    /// Exchanges currently being processed.
    pub in_flight: u64,
}

impl RouteStats {
    pub(crate) fn record_received(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self, in_flight: u64) -> RouteStatsSnapshot {
        RouteStatsSnapshot {
            total: self.total.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            in_flight,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_running_states_accept() {
        assert!(RouteStatus::Started.is_accepting());
        assert!(RouteStatus::Starting.is_accepting());
        assert!(!RouteStatus::Suspended.is_accepting());
        assert!(!RouteStatus::Stopping.is_accepting());
        assert!(!RouteStatus::Stopped.is_accepting());
    }

    #[test]
    fn health_transitions() {
        let health = HealthReporter::new("r");
        assert_eq!(health.current(), RouteHealth::Up);
        health.report_down("feed unavailable");
        assert_eq!(
            health.current(),
            RouteHealth::Down {
                reason: "feed unavailable".to_string()
            }
        );
        health.report_up();
        assert_eq!(health.current(), RouteHealth::Up);
    }

    #[test]
    fn stats_snapshot() {
        let stats = RouteStats::default();
        stats.record_received();
        stats.record_received();
        stats.record_completed();
        stats.record_failed();
        assert_eq!(
            stats.snapshot(0),
            RouteStatsSnapshot {
                total: 2,
                completed: 1,
                failed: 1,
                in_flight: 0
            }
        );
    }
}
