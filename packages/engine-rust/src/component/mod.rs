//! Built-in components.
//!
//! - [`direct`]: synchronous in-process call into a single consumer
//! - [`seda`]: bounded in-memory queue with concurrent consumers
//! - [`mock`]: records exchanges and checks expectations
//! - [`log`]: logs exchanges
//! - [`timer`]: periodic exchanges
//! - [`file`]: writes files and polls directories
//! - [`http`]: axum server consumer and reqwest producer
//! - [`feed`]: ordered in-memory change feed with a persistent cursor
//! - [`bean`]: invokes a registered bean method

pub mod bean;
pub mod direct;
pub mod feed;
pub mod file;
pub mod http;
pub mod log;
pub mod mock;
pub mod seda;
pub mod timer;

use std::sync::Arc;

use switchyard_core::Exchange;

use crate::endpoint::EndpointRegistry;

/// Registers every built-in component under its scheme.
pub fn register_builtin(endpoints: &EndpointRegistry) {
    endpoints.add_component("direct", Arc::new(direct::DirectComponent::new()));
    endpoints.add_component("seda", Arc::new(seda::SedaComponent::new()));
    endpoints.add_component("mock", Arc::new(mock::MockComponent));
    endpoints.add_component("log", Arc::new(log::LogComponent));
    endpoints.add_component("timer", Arc::new(timer::TimerComponent));
    endpoints.add_component("file", Arc::new(file::FileComponent));
    endpoints.add_component("http", Arc::new(http::HttpComponent::new()));
    endpoints.add_component("feed", Arc::new(feed::FeedComponent));
    endpoints.add_component("bean", Arc::new(bean::BeanComponent));
}

/// Replaces `exchange` with the exchange a route handed back, keeping the
/// caller's route id.
pub(crate) fn adopt_reply(exchange: &mut Exchange, reply: Exchange) {
    let route_id = exchange.route_id().map(str::to_string);
    *exchange = reply;
    if let Some(route_id) = route_id {
        exchange.set_route_id(route_id);
    }
}
