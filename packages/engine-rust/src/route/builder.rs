//! Fluent route DSL.
//!
//! ```ignore
//! RouteBuilder::from("direct:start")
//!     .route_id("greet")
//!     .set_header("greeting", "Hello")
//!     .choice(|c| {
//!         c.when(Predicate::has_header("vip"), |s| s.to("mock:vip"))
//!             .otherwise(|s| s.to("mock:regular"))
//!     })
//!     .to("log:done");
//! ```

use std::sync::Arc;
use std::time::Duration;

use switchyard_core::{DataFormat, Exchange, ExchangePattern, Expression, Predicate, TypeKey};
use tracing::Level;

use super::definition::{
    walk, AggregateDef, ErrorHandlerDef, MulticastDef, RecipientListDef, RedeliveryPolicy,
    RouteDefinition, SplitDef, StepDef, StrategyRef,
};
use crate::endpoint::EndpointRegistry;
use crate::error::EngineError;
use crate::processor::flow::{Catch, LoopMode};
use crate::processor::Processor;

// ---------------------------------------------------------------------------
// StepsDsl
// ---------------------------------------------------------------------------

/// Step methods shared by routes and nested blocks.
///
/// Implementors only provide [`push_step`](Self::push_step).
pub trait StepsDsl: Sized {
    #[must_use]
    fn push_step(self, step: StepDef) -> Self;

    /// Runs a closure against the exchange.
    #[must_use]
    fn process<F>(self, f: F) -> Self
    where
        F: Fn(&mut Exchange) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.process_named("process", f)
    }

    /// Like [`process`](Self::process), naming the step in failures and logs.
    #[must_use]
    fn process_named<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut Exchange) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.push_step(StepDef::Process {
            name: name.into(),
            f: Arc::new(f),
        })
    }

    #[must_use]
    fn processor(self, processor: impl Processor + 'static) -> Self {
        self.push_step(StepDef::Custom(Arc::new(processor)))
    }

    #[must_use]
    fn set_body(self, value: impl Into<Expression>) -> Self {
        self.push_step(StepDef::SetBody(value.into()))
    }

    #[must_use]
    fn set_header(self, name: impl Into<String>, value: impl Into<Expression>) -> Self {
        self.push_step(StepDef::SetHeader {
            name: name.into(),
            value: value.into(),
        })
    }

    #[must_use]
    fn set_property(self, name: impl Into<String>, value: impl Into<Expression>) -> Self {
        self.push_step(StepDef::SetProperty {
            name: name.into(),
            value: value.into(),
        })
    }

    #[must_use]
    fn remove_header(self, name: impl Into<String>) -> Self {
        self.remove_headers(name, &[])
    }

    /// Removes headers matching a `*` pattern, except those matching any of
    /// `excludes`.
    #[must_use]
    fn remove_headers(self, pattern: impl Into<String>, excludes: &[&str]) -> Self {
        self.push_step(StepDef::RemoveHeaders {
            pattern: pattern.into(),
            excludes: excludes.iter().map(|s| (*s).to_string()).collect(),
        })
    }

    #[must_use]
    fn remove_property(self, name: impl Into<String>) -> Self {
        self.remove_properties(name, &[])
    }

    #[must_use]
    fn remove_properties(self, pattern: impl Into<String>, excludes: &[&str]) -> Self {
        self.push_step(StepDef::RemoveProperties {
            pattern: pattern.into(),
            excludes: excludes.iter().map(|s| (*s).to_string()).collect(),
        })
    }

    #[must_use]
    fn convert_body_to(self, target: TypeKey) -> Self {
        self.push_step(StepDef::ConvertBodyTo(target))
    }

    #[must_use]
    fn marshal(self, format: DataFormat) -> Self {
        self.push_step(StepDef::Marshal(format))
    }

    #[must_use]
    fn unmarshal(self, format: DataFormat) -> Self {
        self.push_step(StepDef::Unmarshal(format))
    }

    #[must_use]
    fn filter(self, predicate: Predicate, block: impl FnOnce(Steps) -> Steps) -> Self {
        self.push_step(StepDef::Filter {
            predicate,
            steps: block(Steps::new()).into_steps(),
        })
    }

    #[must_use]
    fn choice(self, block: impl FnOnce(ChoiceBlock) -> ChoiceBlock) -> Self {
        let choice = block(ChoiceBlock::default());
        self.push_step(StepDef::Choice {
            whens: choice.whens,
            otherwise: choice.otherwise,
        })
    }

    /// Sends to `uri` using the exchange's own pattern.
    #[must_use]
    fn to(self, uri: impl Into<String>) -> Self {
        self.push_step(StepDef::To {
            uri: uri.into(),
            pattern: None,
        })
    }

    #[must_use]
    fn to_in_out(self, uri: impl Into<String>) -> Self {
        self.push_step(StepDef::To {
            uri: uri.into(),
            pattern: Some(ExchangePattern::InOut),
        })
    }

    #[must_use]
    fn to_in_only(self, uri: impl Into<String>) -> Self {
        self.push_step(StepDef::To {
            uri: uri.into(),
            pattern: Some(ExchangePattern::InOnly),
        })
    }

    #[must_use]
    fn wire_tap(self, uri: impl Into<String>) -> Self {
        self.push_step(StepDef::WireTap { uri: uri.into() })
    }

    /// Replaces the message with the reply of a request-reply call to `uri`.
    #[must_use]
    fn enrich(self, uri: impl Into<String>) -> Self {
        self.push_step(StepDef::Enrich {
            uri: uri.into(),
            strategy: None,
        })
    }

    #[must_use]
    fn enrich_with(self, uri: impl Into<String>, strategy: StrategyRef) -> Self {
        self.push_step(StepDef::Enrich {
            uri: uri.into(),
            strategy: Some(strategy),
        })
    }

    #[must_use]
    fn multicast(self, multicast: MulticastDef) -> Self {
        self.push_step(StepDef::Multicast(multicast))
    }

    #[must_use]
    fn recipient_list(self, recipients: RecipientListDef) -> Self {
        self.push_step(StepDef::RecipientList(recipients))
    }

    #[must_use]
    fn split(self, split: SplitDef) -> Self {
        self.push_step(StepDef::Split(split))
    }

    #[must_use]
    fn aggregate(self, aggregate: AggregateDef) -> Self {
        self.push_step(StepDef::Aggregate(aggregate))
    }

    /// Invokes the bean's only or default method.
    #[must_use]
    fn bean(self, bean: impl Into<String>) -> Self {
        self.push_step(StepDef::Bean {
            bean: bean.into(),
            method: None,
        })
    }

    #[must_use]
    fn bean_method(self, bean: impl Into<String>, method: impl Into<String>) -> Self {
        self.push_step(StepDef::Bean {
            bean: bean.into(),
            method: Some(method.into()),
        })
    }

    /// Repeats `block` as many times as `count` evaluates to.
    #[must_use]
    fn loop_count(self, count: impl Into<Expression>, block: impl FnOnce(Steps) -> Steps) -> Self {
        self.push_step(StepDef::Loop {
            mode: LoopMode::Count(count.into()),
            steps: block(Steps::new()).into_steps(),
        })
    }

    #[must_use]
    fn loop_while(self, predicate: Predicate, block: impl FnOnce(Steps) -> Steps) -> Self {
        self.push_step(StepDef::Loop {
            mode: LoopMode::While(predicate),
            steps: block(Steps::new()).into_steps(),
        })
    }

    /// Runs `block` on a worker pool of `pool_size` tasks.
    #[must_use]
    fn threads(self, pool_size: usize, block: impl FnOnce(Steps) -> Steps) -> Self {
        self.push_step(StepDef::Threads {
            pool_size,
            steps: block(Steps::new()).into_steps(),
        })
    }

    #[must_use]
    fn do_try(
        self,
        body: impl FnOnce(Steps) -> Steps,
        handlers: impl FnOnce(TryBlock) -> TryBlock,
    ) -> Self {
        let handlers = handlers(TryBlock::default());
        self.push_step(StepDef::DoTry {
            body: body(Steps::new()).into_steps(),
            catches: handlers.catches,
            finally: handlers.finally,
        })
    }

    #[must_use]
    fn log(self, message: impl Into<Expression>) -> Self {
        self.log_at(Level::INFO, message)
    }

    #[must_use]
    fn log_at(self, level: Level, message: impl Into<Expression>) -> Self {
        self.push_step(StepDef::Log {
            level,
            message: message.into(),
        })
    }

    #[must_use]
    fn delay(self, delay: Duration) -> Self {
        self.push_step(StepDef::Delay(delay))
    }

    /// Ends routing of the exchange successfully.
    #[must_use]
    fn stop(self) -> Self {
        self.push_step(StepDef::Stop)
    }
}

// ---------------------------------------------------------------------------
// Nested blocks
// ---------------------------------------------------------------------------

/// Steps of a nested block.
#[derive(Clone, Default)]
pub struct Steps(Vec<StepDef>);

impl Steps {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn into_steps(self) -> Vec<StepDef> {
        self.0
    }
}

impl StepsDsl for Steps {
    fn push_step(mut self, step: StepDef) -> Self {
        self.0.push(step);
        self
    }
}

#[derive(Default)]
pub struct ChoiceBlock {
    whens: Vec<(Predicate, Vec<StepDef>)>,
    otherwise: Option<Vec<StepDef>>,
}

impl ChoiceBlock {
    #[must_use]
    pub fn when(mut self, predicate: Predicate, block: impl FnOnce(Steps) -> Steps) -> Self {
        self.whens.push((predicate, block(Steps::new()).into_steps()));
        self
    }

    #[must_use]
    pub fn otherwise(mut self, block: impl FnOnce(Steps) -> Steps) -> Self {
        self.otherwise = Some(block(Steps::new()).into_steps());
        self
    }
}

#[derive(Default)]
pub struct TryBlock {
    catches: Vec<(Catch, Vec<StepDef>)>,
    finally: Option<Vec<StepDef>>,
}

impl TryBlock {
    #[must_use]
    pub fn catch(mut self, catch: Catch, block: impl FnOnce(Steps) -> Steps) -> Self {
        self.catches.push((catch, block(Steps::new()).into_steps()));
        self
    }

    #[must_use]
    pub fn finally(mut self, block: impl FnOnce(Steps) -> Steps) -> Self {
        self.finally = Some(block(Steps::new()).into_steps());
        self
    }
}

// ---------------------------------------------------------------------------
// RouteBuilder
// ---------------------------------------------------------------------------

/// Builds a [`RouteDefinition`].
///
/// The builder can be reused; each [`build`](Self::build) snapshots it.
#[derive(Clone)]
pub struct RouteBuilder {
    from: Option<String>,
    id: Option<String>,
    auto_startup: bool,
    description: Option<String>,
    error_handler: ErrorHandlerDef,
    steps: Vec<StepDef>,
}

impl Default for RouteBuilder {
    fn default() -> Self {
        Self {
            from: None,
            id: None,
            auto_startup: true,
            description: None,
            error_handler: ErrorHandlerDef::default(),
            steps: Vec::new(),
        }
    }
}

impl RouteBuilder {
    /// Starts a route consuming from `uri`.
    #[must_use]
    pub fn from(uri: impl Into<String>) -> Self {
        Self {
            from: Some(uri.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn route_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Whether the context starts this route when it starts. Defaults to `true`.
    #[must_use]
    pub fn auto_startup(mut self, auto_startup: bool) -> Self {
        self.auto_startup = auto_startup;
        self
    }

    #[must_use]
    pub fn dead_letter_channel(mut self, uri: impl Into<String>) -> Self {
        self.error_handler.dead_letter_uri = Some(uri.into());
        self
    }

    #[must_use]
    pub fn redelivery(mut self, policy: RedeliveryPolicy) -> Self {
        self.error_handler.redelivery = policy;
        self
    }

    #[must_use]
    pub fn use_original_message(mut self) -> Self {
        self.error_handler.use_original_message = true;
        self
    }

    /// Validates the route and snapshots it into a definition.
    ///
    /// Every statically known endpoint URI must name a registered component
    /// and use only parameters it accepts. Endpoints are not created here.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidRoute`] for structural problems and the
    /// endpoint registry's errors for bad URIs.
    pub fn build(&self, endpoints: &EndpointRegistry) -> Result<RouteDefinition, EngineError> {
        let (id, generated_id) = match &self.id {
            Some(id) if id.trim().is_empty() => {
                return Err(EngineError::invalid_route(id, "route id must not be blank"))
            }
            Some(id) => (id.clone(), false),
            None => {
                let mut id = uuid::Uuid::new_v4().simple().to_string();
                id.truncate(8);
                (format!("route-{id}"), true)
            }
        };
        let from = self
            .from
            .as_deref()
            .ok_or_else(|| EngineError::invalid_route(&id, "route has no source endpoint"))?;
        let from = endpoints.validate(from)?;

        if let Some(uri) = &self.error_handler.dead_letter_uri {
            endpoints.validate(uri)?;
        }

        let mut problems: Vec<String> = Vec::new();
        let mut uris: Vec<&str> = Vec::new();
        walk(&self.steps, &mut |step| {
            uris.extend(step.static_uris());
            match step {
                StepDef::Aggregate(aggregate) => {
                    if aggregate.completion_size == Some(0) {
                        problems.push("aggregate completion size must be greater than 0".into());
                    }
                    if !aggregate.has_completion() {
                        problems.push("aggregate needs a completion size, predicate, or timeout".into());
                    }
                }
                StepDef::Threads { pool_size: 0, .. } => {
                    problems.push("threads pool size must be greater than 0".into());
                }
                StepDef::Multicast(multicast) if multicast.uris.is_empty() => {
                    problems.push("multicast needs at least one endpoint".into());
                }
                _ => {}
            }
        });
        if let Some(problem) = problems.into_iter().next() {
            return Err(EngineError::invalid_route(&id, problem));
        }
        for uri in uris {
            endpoints.validate(uri)?;
        }

        Ok(RouteDefinition {
            id,
            generated_id,
            from,
            auto_startup: self.auto_startup,
            description: self.description.clone(),
            error_handler: self.error_handler.clone(),
            steps: self.steps.clone(),
        })
    }
}

impl StepsDsl for RouteBuilder {
    fn push_step(mut self, step: StepDef) -> Self {
        self.steps.push(step);
        self
    }
}

#[cfg(test)]
mod tests {
    use switchyard_core::TypeConverterRegistry;

    use super::*;
    use crate::bean::BeanRegistry;
    use crate::component::register_builtin;
    use crate::config::EngineConfig;
    use crate::endpoint::ComponentContext;
    use crate::processor::split::Splitter;
    use crate::processor::StringConcat;
    use crate::properties::MapProperties;
    use crate::registry::Registry;

    fn endpoints() -> EndpointRegistry {
        let ctx = ComponentContext {
            converters: Arc::new(TypeConverterRegistry::with_defaults()),
            registry: Arc::new(Registry::new()),
            beans: Arc::new(BeanRegistry::new()),
            config: Arc::new(EngineConfig::default()),
        };
        let registry = EndpointRegistry::new(ctx, Arc::new(MapProperties::new()));
        register_builtin(&registry);
        registry
    }

    #[test]
    fn unknown_destination_scheme_fails_the_build() {
        let route = RouteBuilder::from("direct:start").to("nosuch:thing");
        assert!(matches!(
            route.build(&endpoints()),
            Err(EngineError::NoSuchEndpointComponent { scheme, .. }) if scheme == "nosuch"
        ));
    }

    #[test]
    fn nested_uris_are_validated() {
        let route = RouteBuilder::from("direct:start").filter(Predicate::constant(true), |s| {
            s.to("mock:ok").to("log:x?colour=red")
        });
        assert!(matches!(
            route.build(&endpoints()),
            Err(EngineError::UnknownParameter { param, .. }) if param == "colour"
        ));
    }

    #[test]
    fn aggregate_size_zero_is_rejected() {
        let route = RouteBuilder::from("direct:start").aggregate(
            AggregateDef::new(Expression::header("id"), StrategyRef::inline(StringConcat::new("")))
                .completion_size(0),
        );
        assert!(matches!(
            route.build(&endpoints()),
            Err(EngineError::InvalidRoute { reason, .. }) if reason.contains("size")
        ));
    }

    #[test]
    fn source_is_required() {
        let route = RouteBuilder::default().to("mock:x");
        assert!(matches!(
            route.build(&endpoints()),
            Err(EngineError::InvalidRoute { reason, .. }) if reason.contains("source")
        ));
    }

    #[test]
    fn definitions_are_snapshots() {
        let endpoints = endpoints();
        let builder = RouteBuilder::from("direct:a").route_id("snap").to("mock:one");
        let first = builder.build(&endpoints).unwrap();
        let builder = builder.to("mock:two");
        let second = builder.build(&endpoints).unwrap();
        assert_eq!(first.steps().len(), 1);
        assert_eq!(second.steps().len(), 2);
        assert_eq!(first.id(), "snap");
        assert!(!first.generated_id);
    }

    #[test]
    fn generated_ids_are_marked() {
        let definition = RouteBuilder::from("direct:a")
            .split(SplitDef::new(Splitter::Lines).steps(|s| s.to("mock:line")))
            .build(&endpoints())
            .unwrap();
        assert!(definition.generated_id);
        assert!(definition.id().starts_with("route-"));
        assert_eq!(definition.from_uri(), "direct:a");
    }
}
