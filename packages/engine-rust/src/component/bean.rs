//! `bean:name?method=m` -- invokes a registered bean method as an endpoint.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use switchyard_core::Exchange;

use crate::bean::{invoke_on, BeanMethod};
use crate::endpoint::{
    unsupported, Component, ComponentContext, Consumer, Endpoint, EndpointParams, Producer,
    RouteBinding,
};
use crate::error::EngineError;

const PARAMETERS: &[&str] = &["method"];

pub struct BeanComponent;

#[async_trait]
impl Component for BeanComponent {
    fn parameter_names(&self) -> &[&'static str] {
        PARAMETERS
    }

    fn create_endpoint(
        &self,
        params: &EndpointParams,
        ctx: &ComponentContext,
    ) -> Result<Arc<dyn Endpoint>, EngineError> {
        let bean = params.path().trim();
        let method = ctx.beans.method(bean, params.get("method"))?;
        Ok(Arc::new(BeanEndpoint {
            uri: params.uri().to_string(),
            step: format!("bean({bean})"),
            method,
        }))
    }
}

pub struct BeanEndpoint {
    uri: String,
    step: String,
    method: BeanMethod,
}

impl Endpoint for BeanEndpoint {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn create_producer(&self) -> Result<Arc<dyn Producer>, EngineError> {
        Ok(Arc::new(BeanProducer {
            step: self.step.clone(),
            method: self.method.clone(),
        }))
    }

    fn create_consumer(&self, _binding: RouteBinding) -> Result<Box<dyn Consumer>, EngineError> {
        Err(unsupported(&self.uri, "consuming"))
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

struct BeanProducer {
    step: String,
    method: BeanMethod,
}

#[async_trait]
impl Producer for BeanProducer {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), EngineError> {
        if let Err(err) = invoke_on(&self.method, exchange).await {
            exchange.fail(self.step.clone(), err);
        }
        Ok(())
    }
}
