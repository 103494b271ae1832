//! `log:name` -- logs each exchange through `tracing` with `name` as the
//! logger field.

use std::any::Any;
use std::fmt::Write as _;
use std::sync::Arc;

use async_trait::async_trait;
use switchyard_core::Exchange;
use tracing::Level;

use crate::endpoint::{
    unsupported, Component, ComponentContext, Consumer, Endpoint, EndpointParams, Producer,
    RouteBinding,
};
use crate::error::EngineError;
use crate::processor::transform::log_at;

const PARAMETERS: &[&str] = &["level", "showHeaders", "showBody", "showProperties"];

pub struct LogComponent;

#[async_trait]
impl Component for LogComponent {
    fn parameter_names(&self) -> &[&'static str] {
        PARAMETERS
    }

    fn create_endpoint(
        &self,
        params: &EndpointParams,
        _ctx: &ComponentContext,
    ) -> Result<Arc<dyn Endpoint>, EngineError> {
        let logger = match params.path().trim() {
            "" => "switchyard.log".to_string(),
            name => name.to_string(),
        };
        Ok(Arc::new(LogEndpoint {
            uri: params.uri().to_string(),
            formatter: Arc::new(LogFormatter {
                logger,
                level: params.parse_or("level", Level::INFO)?,
                show_headers: params.flag("showHeaders", false)?,
                show_body: params.flag("showBody", true)?,
                show_properties: params.flag("showProperties", false)?,
            }),
        }))
    }
}

struct LogFormatter {
    logger: String,
    level: Level,
    show_headers: bool,
    show_body: bool,
    show_properties: bool,
}

impl LogFormatter {
    fn format(&self, exchange: &Exchange) -> String {
        let mut out = format!("Exchange[Pattern: {:?}", exchange.pattern());
        if self.show_properties && !exchange.properties().is_empty() {
            let _ = write!(out, ", Properties: {:?}", exchange.properties());
        }
        if self.show_headers {
            let _ = write!(out, ", Headers: {:?}", exchange.message().headers());
        }
        if self.show_body {
            let _ = write!(out, ", Body: {}", exchange.body());
        }
        out.push(']');
        out
    }
}

pub struct LogEndpoint {
    uri: String,
    formatter: Arc<LogFormatter>,
}

impl LogEndpoint {
    /// The line this endpoint would log for `exchange`.
    #[must_use]
    pub fn render(&self, exchange: &Exchange) -> String {
        self.formatter.format(exchange)
    }
}

impl Endpoint for LogEndpoint {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn create_producer(&self) -> Result<Arc<dyn Producer>, EngineError> {
        Ok(Arc::new(LogProducer(Arc::clone(&self.formatter))))
    }

    fn create_consumer(&self, _binding: RouteBinding) -> Result<Box<dyn Consumer>, EngineError> {
        Err(unsupported(&self.uri, "consuming"))
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

struct LogProducer(Arc<LogFormatter>);

#[async_trait]
impl Producer for LogProducer {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), EngineError> {
        let line = self.0.format(exchange);
        log_at(self.0.level, &self.0.logger, exchange.id(), &line);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use switchyard_core::{ExchangePattern, Message};

    use super::*;
    use crate::context::SwitchyardContext;

    #[test]
    fn renders_requested_parts() {
        let ctx = SwitchyardContext::new();
        let endpoint = ctx
            .endpoints()
            .resolve_as::<LogEndpoint>("log:orders?showHeaders=true&level=debug")
            .unwrap();
        let exchange = ctx
            .producer_template()
            .new_exchange(ExchangePattern::InOnly, Message::new("hi").with_header("k", 1i64));
        let line = endpoint.render(&exchange);
        assert!(line.starts_with("Exchange[Pattern: InOnly"));
        assert!(line.contains("Headers: {\"k\": "));
        assert!(line.ends_with("Body: hi]"));
    }

    #[test]
    fn body_can_be_hidden() {
        let ctx = SwitchyardContext::new();
        let endpoint = ctx
            .endpoints()
            .resolve_as::<LogEndpoint>("log:quiet?showBody=false")
            .unwrap();
        let exchange = ctx
            .producer_template()
            .new_exchange(ExchangePattern::InOnly, Message::new("secret"));
        assert!(!endpoint.render(&exchange).contains("secret"));
    }

    #[test]
    fn bad_level_is_rejected() {
        let ctx = SwitchyardContext::new();
        let err = ctx.endpoint("log:x?level=loud").err().unwrap();
        assert!(matches!(err, EngineError::InvalidParameterValue { ref param, .. } if param == "level"));
    }

    #[tokio::test]
    async fn producing_never_fails() {
        let ctx = SwitchyardContext::new();
        ctx.producer_template().send_body("log:any", "x").await.unwrap();
    }
}
