//! The immutable step tree a route is assembled from.

use std::sync::Arc;
use std::time::Duration;

use switchyard_core::{DataFormat, Exchange, ExchangePattern, Expression, Predicate, TypeKey};
use tracing::Level;

use super::builder::Steps;
use crate::processor::flow::{Catch, LoopMode};
use crate::processor::split::Splitter;
use crate::processor::{AggregationStrategy, Processor};

pub use crate::processor::RedeliveryPolicy;

pub(crate) type ProcessFn = Arc<dyn Fn(&mut Exchange) -> anyhow::Result<()> + Send + Sync>;

/// An aggregation strategy given inline or looked up by name in the
/// [`Registry`](crate::registry::Registry) when the route starts.
#[derive(Clone)]
pub enum StrategyRef {
    Inline(Arc<dyn AggregationStrategy>),
    Named(String),
}

impl StrategyRef {
    pub fn inline(strategy: impl AggregationStrategy + 'static) -> Self {
        StrategyRef::Inline(Arc::new(strategy))
    }
}

/// One step of a route definition.
#[derive(Clone)]
pub enum StepDef {
    Process {
        name: String,
        f: ProcessFn,
    },
    Custom(Arc<dyn Processor>),
    SetBody(Expression),
    SetHeader {
        name: String,
        value: Expression,
    },
    SetProperty {
        name: String,
        value: Expression,
    },
    RemoveHeaders {
        pattern: String,
        excludes: Vec<String>,
    },
    RemoveProperties {
        pattern: String,
        excludes: Vec<String>,
    },
    ConvertBodyTo(TypeKey),
    Marshal(DataFormat),
    Unmarshal(DataFormat),
    Filter {
        predicate: Predicate,
        steps: Vec<StepDef>,
    },
    Choice {
        whens: Vec<(Predicate, Vec<StepDef>)>,
        otherwise: Option<Vec<StepDef>>,
    },
    To {
        uri: String,
        pattern: Option<ExchangePattern>,
    },
    WireTap {
        uri: String,
    },
    Enrich {
        uri: String,
        strategy: Option<StrategyRef>,
    },
    Multicast(MulticastDef),
    RecipientList(RecipientListDef),
    Split(SplitDef),
    Aggregate(AggregateDef),
    Bean {
        bean: String,
        method: Option<String>,
    },
    Loop {
        mode: LoopMode,
        steps: Vec<StepDef>,
    },
    Threads {
        pool_size: usize,
        steps: Vec<StepDef>,
    },
    DoTry {
        body: Vec<StepDef>,
        catches: Vec<(Catch, Vec<StepDef>)>,
        finally: Option<Vec<StepDef>>,
    },
    Log {
        level: Level,
        message: Expression,
    },
    Delay(Duration),
    Stop,
}

impl StepDef {
    /// Endpoint URIs this step sends to, when known before routing.
    pub(crate) fn static_uris(&self) -> Vec<&str> {
        match self {
            StepDef::To { uri, .. } | StepDef::WireTap { uri } | StepDef::Enrich { uri, .. } => {
                vec![uri.as_str()]
            }
            StepDef::Multicast(multicast) => multicast.uris.iter().map(String::as_str).collect(),
            _ => Vec::new(),
        }
    }

    /// Nested step blocks.
    pub(crate) fn children(&self) -> Vec<&[StepDef]> {
        match self {
            StepDef::Filter { steps, .. }
            | StepDef::Loop { steps, .. }
            | StepDef::Threads { steps, .. } => vec![steps.as_slice()],
            StepDef::Split(split) => vec![split.steps.as_slice()],
            StepDef::Aggregate(aggregate) => vec![aggregate.steps.as_slice()],
            StepDef::Choice { whens, otherwise } => whens
                .iter()
                .map(|(_, steps)| steps.as_slice())
                .chain(otherwise.iter().map(Vec::as_slice))
                .collect(),
            StepDef::DoTry {
                body,
                catches,
                finally,
            } => std::iter::once(body.as_slice())
                .chain(catches.iter().map(|(_, steps)| steps.as_slice()))
                .chain(finally.iter().map(Vec::as_slice))
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Visits every step, depth first.
pub(crate) fn walk<'a>(steps: &'a [StepDef], visit: &mut dyn FnMut(&'a StepDef)) {
    for step in steps {
        visit(step);
        for block in step.children() {
            walk(block, visit);
        }
    }
}

// ---------------------------------------------------------------------------
// Composite step definitions
// ---------------------------------------------------------------------------

/// Options shared by multicast and recipient lists.
#[derive(Clone, Default)]
pub struct FanOutDef {
    pub(crate) parallel: bool,
    pub(crate) strategy: Option<StrategyRef>,
    pub(crate) stop_on_exception: bool,
}

#[derive(Clone)]
pub struct MulticastDef {
    pub(crate) uris: Vec<String>,
    pub(crate) options: FanOutDef,
}

impl MulticastDef {
    pub fn new<I, S>(uris: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            uris: uris.into_iter().map(Into::into).collect(),
            options: FanOutDef::default(),
        }
    }

    #[must_use]
    pub fn parallel(mut self) -> Self {
        self.options.parallel = true;
        self
    }

    #[must_use]
    pub fn strategy(mut self, strategy: StrategyRef) -> Self {
        self.options.strategy = Some(strategy);
        self
    }

    #[must_use]
    pub fn stop_on_exception(mut self) -> Self {
        self.options.stop_on_exception = true;
        self
    }
}

#[derive(Clone)]
pub struct RecipientListDef {
    pub(crate) expression: Expression,
    pub(crate) delimiter: String,
    pub(crate) options: FanOutDef,
}

impl RecipientListDef {
    #[must_use]
    pub fn new(expression: Expression) -> Self {
        Self {
            expression,
            delimiter: ",".to_string(),
            options: FanOutDef::default(),
        }
    }

    pub fn delimiter(mut self, delimiter: impl Into<String>) -> Self {
        self.delimiter = delimiter.into();
        self
    }

    #[must_use]
    pub fn parallel(mut self) -> Self {
        self.options.parallel = true;
        self
    }

    #[must_use]
    pub fn strategy(mut self, strategy: StrategyRef) -> Self {
        self.options.strategy = Some(strategy);
        self
    }

    #[must_use]
    pub fn stop_on_exception(mut self) -> Self {
        self.options.stop_on_exception = true;
        self
    }
}

#[derive(Clone)]
pub struct SplitDef {
    pub(crate) splitter: Splitter,
    pub(crate) steps: Vec<StepDef>,
    pub(crate) strategy: Option<StrategyRef>,
    pub(crate) parallel: bool,
    pub(crate) ordered: bool,
    pub(crate) stop_on_exception: bool,
}

impl SplitDef {
    #[must_use]
    pub fn new(splitter: Splitter) -> Self {
        Self {
            splitter,
            steps: Vec::new(),
            strategy: None,
            parallel: false,
            ordered: false,
            stop_on_exception: false,
        }
    }

    /// Steps each part runs through.
    #[must_use]
    pub fn steps(mut self, block: impl FnOnce(Steps) -> Steps) -> Self {
        self.steps = block(Steps::new()).into_steps();
        self
    }

    #[must_use]
    pub fn strategy(mut self, strategy: StrategyRef) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Processes parts concurrently, folding results as they complete.
    #[must_use]
    pub fn parallel(mut self) -> Self {
        self.parallel = true;
        self
    }

    /// With [`parallel`](Self::parallel), folds results in split order.
    #[must_use]
    pub fn ordered(mut self) -> Self {
        self.ordered = true;
        self
    }

    #[must_use]
    pub fn stop_on_exception(mut self) -> Self {
        self.stop_on_exception = true;
        self
    }
}

#[derive(Clone)]
pub struct AggregateDef {
    pub(crate) correlation: Expression,
    pub(crate) strategy: StrategyRef,
    pub(crate) steps: Vec<StepDef>,
    pub(crate) completion_size: Option<usize>,
    pub(crate) completion_predicate: Option<Predicate>,
    pub(crate) completion_timeout: Option<Duration>,
    pub(crate) force_completion_on_stop: bool,
}

impl AggregateDef {
    #[must_use]
    pub fn new(correlation: Expression, strategy: StrategyRef) -> Self {
        Self {
            correlation,
            strategy,
            steps: Vec::new(),
            completion_size: None,
            completion_predicate: None,
            completion_timeout: None,
            force_completion_on_stop: false,
        }
    }

    /// Steps the completed aggregate runs through.
    #[must_use]
    pub fn steps(mut self, block: impl FnOnce(Steps) -> Steps) -> Self {
        self.steps = block(Steps::new()).into_steps();
        self
    }

    #[must_use]
    pub fn completion_size(mut self, size: usize) -> Self {
        self.completion_size = Some(size);
        self
    }

    #[must_use]
    pub fn completion_predicate(mut self, predicate: Predicate) -> Self {
        self.completion_predicate = Some(predicate);
        self
    }

    /// Completes a group once it has received nothing for `timeout`.
    #[must_use]
    pub fn completion_timeout(mut self, timeout: Duration) -> Self {
        self.completion_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn force_completion_on_stop(mut self) -> Self {
        self.force_completion_on_stop = true;
        self
    }

    pub(crate) fn has_completion(&self) -> bool {
        self.completion_size.is_some()
            || self.completion_predicate.is_some()
            || self.completion_timeout.is_some()
    }
}

// ---------------------------------------------------------------------------
// RouteDefinition
// ---------------------------------------------------------------------------

/// What the route does with failures nothing inside it handled.
#[derive(Debug, Clone, Default)]
pub struct ErrorHandlerDef {
    /// Fire-and-forget exchanges that fail are forwarded here.
    pub dead_letter_uri: Option<String>,
    /// Redelivery of a failing step before its failure is recorded.
    pub redelivery: RedeliveryPolicy,
    /// Send the message as it entered the route to the dead letter channel
    /// rather than the message at the time of failure.
    pub use_original_message: bool,
}

/// A validated route. Never changes once built.
#[derive(Clone)]
pub struct RouteDefinition {
    pub(crate) id: String,
    pub(crate) generated_id: bool,
    pub(crate) from: String,
    pub(crate) auto_startup: bool,
    pub(crate) description: Option<String>,
    pub(crate) error_handler: ErrorHandlerDef,
    pub(crate) steps: Vec<StepDef>,
}

impl RouteDefinition {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Normalized URI of the source endpoint.
    #[must_use]
    pub fn from_uri(&self) -> &str {
        &self.from
    }

    #[must_use]
    pub fn auto_startup(&self) -> bool {
        self.auto_startup
    }

    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    #[must_use]
    pub fn error_handler(&self) -> &ErrorHandlerDef {
        &self.error_handler
    }

    #[must_use]
    pub fn steps(&self) -> &[StepDef] {
        &self.steps
    }

    pub(crate) fn assign_id(&mut self, id: String) {
        self.id = id;
        self.generated_id = false;
    }
}

impl std::fmt::Debug for RouteDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteDefinition")
            .field("id", &self.id)
            .field("from", &self.from)
            .field("auto_startup", &self.auto_startup)
            .field("steps", &self.steps.len())
            .finish_non_exhaustive()
    }
}
