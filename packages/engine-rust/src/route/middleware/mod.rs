//! Tower middleware layers for the route processing stack.
//!
//! - [`admission`]: rejects exchanges while the route is not accepting
//! - [`backpressure`]: per-route concurrency bound, waiting or rejecting
//! - [`timeout`]: request-reply timeout enforcement
//! - [`metrics`]: exchange timing, counters, and route statistics
//! - [`pipeline`]: composes all layers around the route's pipeline

pub mod admission;
pub mod backpressure;
pub mod metrics;
pub mod pipeline;
pub mod timeout;

pub use admission::AdmissionLayer;
pub use backpressure::BackpressureLayer;
pub use metrics::MetricsLayer;
pub use pipeline::{build_route_service, RouteHandler, RouteState};
pub use timeout::TimeoutLayer;
