//! Engine-level configuration.

use std::time::Duration;

use crate::properties::PropertiesSource;

/// What a route does when it already has its maximum number of exchanges in
/// flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackpressureMode {
    /// Wait for a slot to free up.
    #[default]
    Wait,
    /// Fail the exchange immediately with [`crate::EngineError::QueueFull`].
    Reject,
}

/// Retry policy for consumers that poll an external source.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound for the exponentially growing delay.
    pub max_backoff: Duration,
    /// Consecutive failures after which the route reports itself unhealthy.
    /// The consumer keeps retrying afterwards.
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            max_attempts: 5,
        }
    }
}

impl RetryConfig {
    /// Backoff for the given (1-based) attempt, doubling up to `max_backoff`.
    #[must_use]
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff)
    }
}

/// Context-wide configuration for routing, concurrency, and shutdown.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Name of the context, used in log output.
    pub name: String,
    /// Timeout applied to request-reply exchanges that carry none of their own.
    pub default_request_timeout_ms: u64,
    /// Maximum number of exchanges a single route processes concurrently.
    pub max_concurrent_exchanges_per_route: u32,
    /// Behaviour when a route is saturated.
    pub backpressure: BackpressureMode,
    /// How long stopping a route waits for in-flight exchanges to finish.
    pub shutdown_timeout_ms: u64,
    /// Concurrency used by parallel split, multicast, and recipient lists.
    pub parallel_processing_limit: usize,
    /// Interval at which aggregators check for timed-out groups.
    pub aggregation_sweep_interval_ms: u64,
    /// Retry policy for polling consumers.
    pub consumer_retry: RetryConfig,
    /// Route ids matching any of these `*` patterns are never added.
    pub route_exclude_patterns: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: "switchyard".to_string(),
            default_request_timeout_ms: 30_000,
            max_concurrent_exchanges_per_route: 1000,
            backpressure: BackpressureMode::Wait,
            shutdown_timeout_ms: 10_000,
            parallel_processing_limit: 10,
            aggregation_sweep_interval_ms: 100,
            consumer_retry: RetryConfig::default(),
            route_exclude_patterns: Vec::new(),
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn default_request_timeout(&self) -> Duration {
        Duration::from_millis(self.default_request_timeout_ms)
    }

    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Overlays values found under the `switchyard.` prefix of `source`.
    ///
    /// Unparseable values are ignored with a warning.
    #[must_use]
    pub fn with_properties(mut self, source: &dyn PropertiesSource) -> Self {
        if let Some(name) = source.get("switchyard.name") {
            self.name = name;
        }
        read_into(source, "switchyard.request-timeout-ms", &mut self.default_request_timeout_ms);
        read_into(
            source,
            "switchyard.max-concurrent-exchanges",
            &mut self.max_concurrent_exchanges_per_route,
        );
        read_into(source, "switchyard.shutdown-timeout-ms", &mut self.shutdown_timeout_ms);
        read_into(
            source,
            "switchyard.parallel-processing-limit",
            &mut self.parallel_processing_limit,
        );
        if let Some(mode) = source.get("switchyard.backpressure") {
            match mode.as_str() {
                "wait" => self.backpressure = BackpressureMode::Wait,
                "reject" => self.backpressure = BackpressureMode::Reject,
                other => tracing::warn!(value = other, "ignoring unknown backpressure mode"),
            }
        }
        if let Some(patterns) = source.get("switchyard.route-exclude-patterns") {
            self.route_exclude_patterns = patterns
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect();
        }
        self
    }
}

fn read_into<T: std::str::FromStr>(source: &dyn PropertiesSource, key: &str, slot: &mut T) {
    if let Some(raw) = source.get(key) {
        match raw.trim().parse() {
            Ok(value) => *slot = value,
            Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable configuration value"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::properties::MapProperties;

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let retry = RetryConfig {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
            max_attempts: 3,
        };
        assert_eq!(retry.backoff_for(1), Duration::from_millis(100));
        assert_eq!(retry.backoff_for(2), Duration::from_millis(200));
        assert_eq!(retry.backoff_for(3), Duration::from_millis(350));
        assert_eq!(retry.backoff_for(40), Duration::from_millis(350));
    }

    #[test]
    fn properties_override_defaults() {
        let props = MapProperties::new()
            .with("switchyard.request-timeout-ms", "250")
            .with("switchyard.backpressure", "reject")
            .with("switchyard.route-exclude-patterns", "debug-*, tmp")
            .with("switchyard.shutdown-timeout-ms", "not a number");

        let config = EngineConfig::default().with_properties(&props);
        assert_eq!(config.default_request_timeout_ms, 250);
        assert_eq!(config.backpressure, BackpressureMode::Reject);
        assert_eq!(config.route_exclude_patterns, vec!["debug-*", "tmp"]);
        assert_eq!(config.shutdown_timeout_ms, 10_000);
    }
}
