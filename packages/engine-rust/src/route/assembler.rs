//! Turns a [`RouteDefinition`] into processors and the route's innermost
//! service.
//!
//! Assembly happens each time a route starts: endpoints are resolved,
//! producers created, beans and named strategies looked up. A route that is
//! restarted gets fresh processors.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use switchyard_core::{keys, Exchange, ExchangePattern, Message};
use tower::Service;

use super::definition::{RouteDefinition, StepDef, StrategyRef};
use crate::endpoint::{EndpointRegistry, Producer};
use crate::error::EngineError;
use crate::processor::aggregate::{Aggregate, Completion};
use crate::processor::flow::{Choice, DoTry, Filter, Loop};
use crate::processor::send::{Enrich, FanOut, Multicast, RecipientList, SendTo, WireTap};
use crate::processor::split::Split;
use crate::processor::threads::Threads;
use crate::processor::transform::{
    BeanStep, Codec, ConvertBodyTo, Delay, FieldTarget, Log, RemoveFields, SetBody, SetField, Stop,
};
use crate::processor::{
    AggregationStrategy, FnProcessor, Pipeline, Processor, RedeliveryPolicy, SharedStrategy,
};

/// A route's processors, ready to be started and wrapped in middleware.
pub struct AssembledRoute {
    pub pipeline: Pipeline,
    pub service: RouteService,
}

/// Builds processors for route definitions against one endpoint registry.
#[derive(Clone)]
pub struct RouteAssembler {
    endpoints: Arc<EndpointRegistry>,
}

impl RouteAssembler {
    #[must_use]
    pub fn new(endpoints: Arc<EndpointRegistry>) -> Self {
        Self { endpoints }
    }

    /// # Errors
    ///
    /// Fails when an endpoint cannot be resolved or cannot produce, or a bean
    /// or named strategy is not registered.
    pub fn assemble(&self, definition: &RouteDefinition) -> Result<AssembledRoute, EngineError> {
        let factory = StepFactory {
            endpoints: &self.endpoints,
            route_id: definition.id(),
            redelivery: &definition.error_handler().redelivery,
        };
        let pipeline = factory.pipeline(definition.steps())?;

        let handler = definition.error_handler();
        let dead_letter = handler
            .dead_letter_uri
            .as_deref()
            .map(|uri| {
                let endpoint = self.endpoints.resolve(uri)?;
                Ok::<_, EngineError>((endpoint.uri().to_string(), endpoint.create_producer()?))
            })
            .transpose()?;

        let service = RouteService {
            route_id: definition.id().into(),
            pipeline: pipeline.clone(),
            dead_letter: dead_letter.map(Arc::new),
            use_original_message: handler.use_original_message,
        };
        Ok(AssembledRoute { pipeline, service })
    }
}

struct StepFactory<'a> {
    endpoints: &'a Arc<EndpointRegistry>,
    route_id: &'a str,
    redelivery: &'a RedeliveryPolicy,
}

impl StepFactory<'_> {
    fn pipeline(&self, steps: &[StepDef]) -> Result<Pipeline, EngineError> {
        let processors = steps
            .iter()
            .map(|step| self.step(step))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Pipeline::new(processors).with_redelivery(self.redelivery.clone()))
    }

    fn producer(&self, uri: &str) -> Result<(String, Arc<dyn Producer>), EngineError> {
        let endpoint = self.endpoints.resolve(uri)?;
        Ok((endpoint.uri().to_string(), endpoint.create_producer()?))
    }

    fn strategy(&self, strategy: &StrategyRef) -> Result<Arc<dyn AggregationStrategy>, EngineError> {
        match strategy {
            StrategyRef::Inline(strategy) => Ok(Arc::clone(strategy)),
            StrategyRef::Named(name) => self
                .endpoints
                .context()
                .registry
                .lookup::<SharedStrategy>(name)
                .map(|shared| shared as Arc<dyn AggregationStrategy>)
                .ok_or_else(|| EngineError::NoSuchBean(name.clone())),
        }
    }

    fn request_timeout(&self) -> Duration {
        self.endpoints.context().config.default_request_timeout()
    }

    fn fan_out(&self, parallel: bool, strategy: Option<&StrategyRef>, stop: bool) -> Result<FanOut, EngineError> {
        let mut fan_out = FanOut::new(self.request_timeout()).stop_on_exception(stop);
        if parallel {
            fan_out = fan_out.parallel(self.endpoints.context().config.parallel_processing_limit);
        }
        if let Some(strategy) = strategy {
            fan_out = fan_out.strategy(self.strategy(strategy)?);
        }
        Ok(fan_out)
    }

    fn step(&self, step: &StepDef) -> Result<Arc<dyn Processor>, EngineError> {
        let ctx = self.endpoints.context();
        let processor: Arc<dyn Processor> = match step {
            StepDef::Process { name, f } => Arc::new(FnProcessor::from_shared(name.clone(), Arc::clone(f))),
            StepDef::Custom(processor) => Arc::clone(processor),
            StepDef::SetBody(expression) => Arc::new(SetBody::new(expression.clone())),
            StepDef::SetHeader { name, value } => {
                Arc::new(SetField::new(FieldTarget::Header, name.clone(), value.clone()))
            }
            StepDef::SetProperty { name, value } => {
                Arc::new(SetField::new(FieldTarget::Property, name.clone(), value.clone()))
            }
            StepDef::RemoveHeaders { pattern, excludes } => Arc::new(RemoveFields::new(
                FieldTarget::Header,
                pattern.clone(),
                excludes.clone(),
            )),
            StepDef::RemoveProperties { pattern, excludes } => Arc::new(RemoveFields::new(
                FieldTarget::Property,
                pattern.clone(),
                excludes.clone(),
            )),
            StepDef::ConvertBodyTo(target) => Arc::new(ConvertBodyTo::new(*target)),
            StepDef::Marshal(format) => Arc::new(Codec::marshal(*format)),
            StepDef::Unmarshal(format) => Arc::new(Codec::unmarshal(*format)),
            StepDef::Filter { predicate, steps } => {
                Arc::new(Filter::new(predicate.clone(), self.pipeline(steps)?))
            }
            StepDef::Choice { whens, otherwise } => {
                let whens = whens
                    .iter()
                    .map(|(predicate, steps)| Ok((predicate.clone(), self.pipeline(steps)?)))
                    .collect::<Result<Vec<_>, EngineError>>()?;
                let otherwise = otherwise.as_deref().map(|steps| self.pipeline(steps)).transpose()?;
                Arc::new(Choice::new(whens, otherwise))
            }
            StepDef::To { uri, pattern } => {
                let (uri, producer) = self.producer(uri)?;
                Arc::new(SendTo::new(uri, producer, *pattern, self.request_timeout()))
            }
            StepDef::WireTap { uri } => {
                let (uri, producer) = self.producer(uri)?;
                Arc::new(WireTap::new(&uri, producer))
            }
            StepDef::Enrich { uri, strategy } => {
                let (uri, producer) = self.producer(uri)?;
                let strategy = strategy.as_ref().map(|s| self.strategy(s)).transpose()?;
                Arc::new(Enrich::new(&uri, producer, strategy, self.request_timeout()))
            }
            StepDef::Multicast(multicast) => {
                let targets = multicast
                    .uris
                    .iter()
                    .map(|uri| self.producer(uri))
                    .collect::<Result<Vec<_>, _>>()?;
                let options = &multicast.options;
                let fan_out = self.fan_out(options.parallel, options.strategy.as_ref(), options.stop_on_exception)?;
                Arc::new(Multicast::new(targets, fan_out))
            }
            StepDef::RecipientList(recipients) => {
                let options = &recipients.options;
                let fan_out = self.fan_out(options.parallel, options.strategy.as_ref(), options.stop_on_exception)?;
                Arc::new(RecipientList::new(
                    recipients.expression.clone(),
                    recipients.delimiter.clone(),
                    Arc::clone(self.endpoints),
                    fan_out,
                ))
            }
            StepDef::Split(split) => {
                let mut splitter = Split::new(split.splitter.clone(), self.pipeline(&split.steps)?)
                    .stop_on_exception(split.stop_on_exception);
                if let Some(strategy) = &split.strategy {
                    splitter = splitter.strategy(self.strategy(strategy)?);
                }
                if split.parallel {
                    splitter = splitter.parallel(ctx.config.parallel_processing_limit, split.ordered);
                }
                Arc::new(splitter)
            }
            StepDef::Aggregate(aggregate) => {
                let completion = Completion {
                    size: aggregate.completion_size,
                    predicate: aggregate.completion_predicate.clone(),
                    timeout: aggregate.completion_timeout,
                    force_on_stop: aggregate.force_completion_on_stop,
                };
                Arc::new(Aggregate::new(
                    aggregate.correlation.clone(),
                    self.strategy(&aggregate.strategy)?,
                    completion,
                    self.pipeline(&aggregate.steps)?,
                    Duration::from_millis(ctx.config.aggregation_sweep_interval_ms),
                ))
            }
            StepDef::Bean { bean, method } => {
                let resolved = ctx.beans.method(bean, method.as_deref())?;
                Arc::new(BeanStep::new(bean, method.as_deref(), resolved))
            }
            StepDef::Loop { mode, steps } => Arc::new(Loop::new(mode.clone(), self.pipeline(steps)?)),
            StepDef::Threads { pool_size, steps } => {
                Arc::new(Threads::new(*pool_size, self.pipeline(steps)?))
            }
            StepDef::DoTry {
                body,
                catches,
                finally,
            } => {
                let catches = catches
                    .iter()
                    .map(|(catch, steps)| Ok((catch.clone(), self.pipeline(steps)?)))
                    .collect::<Result<Vec<_>, EngineError>>()?;
                let finally = finally.as_deref().map(|steps| self.pipeline(steps)).transpose()?;
                Arc::new(DoTry::new(self.pipeline(body)?, catches, finally))
            }
            StepDef::Log { level, message } => {
                Arc::new(Log::new(self.route_id.to_string(), *level, message.clone()))
            }
            StepDef::Delay(delay) => Arc::new(Delay::new(*delay)),
            StepDef::Stop => Arc::new(Stop),
        };
        Ok(processor)
    }
}

// ---------------------------------------------------------------------------
// RouteService
// ---------------------------------------------------------------------------

type DeadLetter = Arc<(String, Arc<dyn Producer>)>;

/// Runs the route pipeline and applies the route's error handler.
///
/// Failures of request-reply exchanges go back to the caller untouched. A
/// failed fire-and-forget exchange is forwarded to the dead letter channel
/// when one is configured, which handles the failure; otherwise it is logged.
#[derive(Clone)]
pub struct RouteService {
    route_id: Arc<str>,
    pipeline: Pipeline,
    dead_letter: Option<DeadLetter>,
    use_original_message: bool,
}

impl RouteService {
    async fn run(self, mut exchange: Exchange) -> Exchange {
        exchange.set_route_id(self.route_id.as_ref());
        let original = self.use_original_message.then(|| exchange.message().clone());

        self.pipeline.run(&mut exchange).await;
        exchange.resume_routing();

        if exchange.pattern() == ExchangePattern::InOnly && exchange.is_failed() {
            self.handle_failure(&mut exchange, original).await;
        }
        exchange
    }

    async fn handle_failure(&self, exchange: &mut Exchange, original: Option<Message>) {
        let Some(failure) = exchange.failure().cloned() else {
            return;
        };
        let Some(dead_letter) = &self.dead_letter else {
            tracing::error!(
                route_id = %self.route_id,
                exchange_id = exchange.id(),
                %failure,
                "fire-and-forget exchange failed"
            );
            return;
        };
        let (uri, producer) = dead_letter.as_ref();

        let mut dead = exchange.copy();
        dead.set_pattern(ExchangePattern::InOnly);
        dead.set_message(original.unwrap_or_else(|| failure.snapshot().clone()));
        dead.set_property(keys::EXCEPTION_CAUGHT, failure.to_string());
        dead.set_property(keys::FAILURE_STEP, failure.step());
        dead.set_property(keys::FAILURE_ROUTE_ID, self.route_id.as_ref());

        match producer.process(&mut dead).await {
            Ok(()) if !dead.is_failed() => {
                tracing::warn!(
                    route_id = %self.route_id,
                    exchange_id = exchange.id(),
                    dead_letter = %uri,
                    %failure,
                    "exchange moved to dead letter channel"
                );
                exchange.take_failure();
                exchange.set_property(keys::EXCEPTION_CAUGHT, failure.to_string());
                exchange.set_property(keys::FAILURE_STEP, failure.step());
            }
            Ok(()) => tracing::error!(
                route_id = %self.route_id,
                exchange_id = exchange.id(),
                dead_letter = %uri,
                %failure,
                "dead letter channel failed; exchange dropped"
            ),
            Err(err) => tracing::error!(
                route_id = %self.route_id,
                exchange_id = exchange.id(),
                dead_letter = %uri,
                %failure,
                error = %err,
                "could not deliver to dead letter channel; exchange dropped"
            ),
        }
    }
}

impl Service<Exchange> for RouteService {
    type Response = Exchange;
    type Error = EngineError;
    type Future = Pin<Box<dyn Future<Output = Result<Exchange, EngineError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, exchange: Exchange) -> Self::Future {
        let this = self.clone();
        Box::pin(async move { Ok(this.run(exchange).await) })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
