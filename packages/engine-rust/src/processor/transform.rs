//! Message transformation steps.

use std::time::Duration;

use async_trait::async_trait;
use switchyard_core::{DataFormat, Exchange, Expression, TypeKey, Value};
use tracing::Level;

use super::Processor;
use crate::bean::{invoke_on, BeanMethod};

pub struct SetBody {
    expression: Expression,
}

impl SetBody {
    #[must_use]
    pub fn new(expression: Expression) -> Self {
        Self { expression }
    }
}

#[async_trait]
impl Processor for SetBody {
    fn name(&self) -> &str {
        "setBody"
    }

    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        let body = self.expression.evaluate(exchange)?;
        exchange.set_body(body);
        Ok(())
    }
}

/// Sets a header or an exchange property from an expression.
pub struct SetField {
    name: String,
    key: String,
    expression: Expression,
    target: FieldTarget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldTarget {
    Header,
    Property,
}

impl SetField {
    #[must_use]
    pub fn new(target: FieldTarget, key: String, expression: Expression) -> Self {
        let name = match target {
            FieldTarget::Header => format!("setHeader({key})"),
            FieldTarget::Property => format!("setProperty({key})"),
        };
        Self {
            name,
            key,
            expression,
            target,
        }
    }
}

#[async_trait]
impl Processor for SetField {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        let value = self.expression.evaluate(exchange)?;
        match self.target {
            FieldTarget::Header => exchange.set_header(self.key.clone(), value),
            FieldTarget::Property => exchange.set_property(self.key.clone(), value),
        }
        Ok(())
    }
}

/// Removes headers or properties by exact name or `*` pattern, keeping
/// names that match any exclude pattern.
pub struct RemoveFields {
    name: String,
    pattern: String,
    excludes: Vec<String>,
    target: FieldTarget,
}

impl RemoveFields {
    #[must_use]
    pub fn new(target: FieldTarget, pattern: String, excludes: Vec<String>) -> Self {
        let name = match target {
            FieldTarget::Header => format!("removeHeaders({pattern})"),
            FieldTarget::Property => format!("removeProperties({pattern})"),
        };
        Self {
            name,
            pattern,
            excludes,
            target,
        }
    }

    fn doomed<'a>(&self, keys: impl Iterator<Item = &'a String>) -> Vec<String> {
        keys.filter(|key| switchyard_core::pattern::wildcard_match(&self.pattern, key))
            .filter(|key| {
                !self
                    .excludes
                    .iter()
                    .any(|ex| switchyard_core::pattern::wildcard_match(ex, key))
            })
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Processor for RemoveFields {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        match self.target {
            FieldTarget::Header => {
                for key in self.doomed(exchange.message().headers().keys()) {
                    exchange.message_mut().remove_header(&key);
                }
            }
            FieldTarget::Property => {
                for key in self.doomed(exchange.properties().keys()) {
                    exchange.remove_property(&key);
                }
            }
        }
        Ok(())
    }
}

pub struct ConvertBodyTo {
    name: String,
    target: TypeKey,
}

impl ConvertBodyTo {
    #[must_use]
    pub fn new(target: TypeKey) -> Self {
        Self {
            name: format!("convertBodyTo({target})"),
            target,
        }
    }
}

#[async_trait]
impl Processor for ConvertBodyTo {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        let converted = exchange.converters().convert(exchange.body(), self.target)?;
        exchange.set_body(converted);
        Ok(())
    }
}

/// Marshals or unmarshals the body with a [`DataFormat`].
pub struct Codec {
    name: String,
    format: DataFormat,
    marshal: bool,
}

impl Codec {
    #[must_use]
    pub fn marshal(format: DataFormat) -> Self {
        Self {
            name: format!("marshal({format})"),
            format,
            marshal: true,
        }
    }

    #[must_use]
    pub fn unmarshal(format: DataFormat) -> Self {
        Self {
            name: format!("unmarshal({format})"),
            format,
            marshal: false,
        }
    }
}

#[async_trait]
impl Processor for Codec {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        let body = if self.marshal {
            Value::Bytes(self.format.marshal(exchange.body())?)
        } else {
            self.format
                .unmarshal(exchange.body(), exchange.converters())?
        };
        exchange.set_body(body);
        Ok(())
    }
}

pub struct Log {
    logger: String,
    level: Level,
    message: Expression,
}

impl Log {
    #[must_use]
    pub fn new(logger: String, level: Level, message: Expression) -> Self {
        Self {
            logger,
            level,
            message,
        }
    }
}

#[async_trait]
impl Processor for Log {
    fn name(&self) -> &str {
        "log"
    }

    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        let text = self.message.evaluate(exchange)?;
        log_at(self.level, &self.logger, exchange.id(), &text.to_string());
        Ok(())
    }
}

/// Emits `message` at a runtime-selected level.
pub(crate) fn log_at(level: Level, logger: &str, exchange_id: &str, message: &str) {
    match level {
        Level::ERROR => tracing::error!(logger, exchange_id, "{message}"),
        Level::WARN => tracing::warn!(logger, exchange_id, "{message}"),
        Level::INFO => tracing::info!(logger, exchange_id, "{message}"),
        Level::DEBUG => tracing::debug!(logger, exchange_id, "{message}"),
        _ => tracing::trace!(logger, exchange_id, "{message}"),
    }
}

pub struct Delay {
    delay: Duration,
}

impl Delay {
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl Processor for Delay {
    fn name(&self) -> &str {
        "delay"
    }

    async fn process(&self, _exchange: &mut Exchange) -> anyhow::Result<()> {
        tokio::time::sleep(self.delay).await;
        Ok(())
    }
}

pub struct Stop;

#[async_trait]
impl Processor for Stop {
    fn name(&self) -> &str {
        "stop"
    }

    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        exchange.stop();
        Ok(())
    }
}

/// Invokes a bean method; a returned value replaces the body.
pub struct BeanStep {
    name: String,
    method: BeanMethod,
}

impl BeanStep {
    #[must_use]
    pub fn new(bean: &str, method: Option<&str>, resolved: BeanMethod) -> Self {
        let name = match method {
            Some(method) => format!("bean({bean}.{method})"),
            None => format!("bean({bean})"),
        };
        Self {
            name,
            method: resolved,
        }
    }
}

#[async_trait]
impl Processor for BeanStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        invoke_on(&self.method, exchange).await
    }
}
