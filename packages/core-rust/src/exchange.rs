//! The unit of work flowing through a route.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::convert::{ConvertError, TypeConverterRegistry};
use crate::message::Message;
use crate::value::{BodyType, Value};

/// Well-known exchange property names set by the engine.
pub mod keys {
    /// Zero-based index of a split part.
    pub const SPLIT_INDEX: &str = "SwitchyardSplitIndex";
    /// `true` on the last split part.
    pub const SPLIT_COMPLETE: &str = "SwitchyardSplitComplete";
    /// Total number of parts, set on the aggregated result of a split.
    pub const SPLIT_SIZE: &str = "SwitchyardSplitSize";
    /// Number of exchanges folded into an aggregate.
    pub const AGGREGATED_SIZE: &str = "SwitchyardAggregatedSize";
    /// Correlation key of an aggregate.
    pub const AGGREGATED_CORRELATION_KEY: &str = "SwitchyardAggregatedCorrelationKey";
    /// What completed an aggregate: `size`, `predicate`, `timeout` or `stop`.
    pub const AGGREGATED_COMPLETED_BY: &str = "SwitchyardAggregatedCompletedBy";
    /// Zero-based iteration of a loop.
    pub const LOOP_INDEX: &str = "SwitchyardLoopIndex";
    /// Zero-based index of a multicast branch.
    pub const MULTICAST_INDEX: &str = "SwitchyardMulticastIndex";
    /// Description of a failure handled by a catch block or dead-letter channel.
    pub const EXCEPTION_CAUGHT: &str = "SwitchyardExceptionCaught";
    /// Step that failed, recorded alongside `EXCEPTION_CAUGHT`.
    pub const FAILURE_STEP: &str = "SwitchyardFailureStep";
    /// Route in which the failure happened.
    pub const FAILURE_ROUTE_ID: &str = "SwitchyardFailureRouteId";
    /// Endpoint most recently sent to.
    pub const TO_ENDPOINT: &str = "SwitchyardToEndpoint";
    /// Number of redelivery attempts made for a failing step.
    pub const REDELIVERY_COUNTER: &str = "SwitchyardRedeliveryCounter";
}

// ---------------------------------------------------------------------------
// ExchangePattern
// ---------------------------------------------------------------------------

/// Messaging pattern of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExchangePattern {
    /// Fire-and-forget: no reply is expected.
    #[default]
    InOnly,
    /// Request-reply: the caller waits for the final message.
    InOut,
}

// ---------------------------------------------------------------------------
// ExchangeFailure
// ---------------------------------------------------------------------------

/// A failure captured in an exchange's exception slot.
///
/// Keeps the original cause and a snapshot of the message as it was when the
/// failing step ran.
#[derive(Debug, Clone)]
pub struct ExchangeFailure {
    step: String,
    cause: Arc<anyhow::Error>,
    snapshot: Box<Message>,
}

impl ExchangeFailure {
    #[must_use]
    pub fn new(step: impl Into<String>, cause: anyhow::Error, snapshot: &Message) -> Self {
        Self {
            step: step.into(),
            cause: Arc::new(cause),
            snapshot: Box::new(snapshot.clone()),
        }
    }

    /// Name of the step that failed.
    #[must_use]
    pub fn step(&self) -> &str {
        &self.step
    }

    #[must_use]
    pub fn cause(&self) -> &anyhow::Error {
        &self.cause
    }

    /// The message at the time of failure.
    #[must_use]
    pub fn snapshot(&self) -> &Message {
        &self.snapshot
    }

    /// Whether any error in the cause chain is an `E`.
    #[must_use]
    pub fn is<E>(&self) -> bool
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.cause.chain().any(|err| err.is::<E>())
    }
}

impl fmt::Display for ExchangeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "step `{}` failed: {:#}", self.step, self.cause)
    }
}

impl std::error::Error for ExchangeFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        let cause: &(dyn std::error::Error + 'static) = &**self.cause;
        Some(cause)
    }
}

// ---------------------------------------------------------------------------
// Exchange
// ---------------------------------------------------------------------------

/// One request/response unit of work.
///
/// Carries exactly one in message, an optional out message for request-reply
/// steps, exchange-scoped properties, and an exception slot. The pipeline
/// promotes a step's out message to the in message before the next step.
#[derive(Debug, Clone)]
pub struct Exchange {
    id: String,
    pattern: ExchangePattern,
    message: Message,
    out: Option<Message>,
    properties: BTreeMap<String, Value>,
    failure: Option<ExchangeFailure>,
    route_id: Option<String>,
    timeout: Option<Duration>,
    stopped: bool,
    converters: Arc<TypeConverterRegistry>,
    created_at: Instant,
}

impl Exchange {
    /// Creates an `InOnly` exchange with an empty message.
    #[must_use]
    pub fn new(converters: Arc<TypeConverterRegistry>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            pattern: ExchangePattern::InOnly,
            message: Message::default(),
            out: None,
            properties: BTreeMap::new(),
            failure: None,
            route_id: None,
            timeout: None,
            stopped: false,
            converters,
            created_at: Instant::now(),
        }
    }

    /// Creates an exchange carrying `message` with the given pattern.
    #[must_use]
    pub fn with_message(
        converters: Arc<TypeConverterRegistry>,
        pattern: ExchangePattern,
        message: Message,
    ) -> Self {
        let mut exchange = Self::new(converters);
        exchange.pattern = pattern;
        exchange.message = message;
        exchange
    }

    /// Produces a branch-isolated copy with a fresh id.
    ///
    /// The copy keeps headers, body, properties, pattern, route, and timeout,
    /// and starts with no out message, no failure, and routing not stopped.
    #[must_use]
    pub fn copy(&self) -> Self {
        self.copy_with_message(self.message.clone())
    }

    /// Like [`copy`](Self::copy) but with a new body. The parent body is not
    /// cloned.
    #[must_use]
    pub fn copy_with_body(&self, body: impl Into<Value>) -> Self {
        let mut message = Message::new(body);
        message.copy_headers_from(&self.message);
        self.copy_with_message(message)
    }

    fn copy_with_message(&self, message: Message) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            pattern: self.pattern,
            message,
            out: None,
            properties: self.properties.clone(),
            failure: None,
            route_id: self.route_id.clone(),
            timeout: self.timeout,
            stopped: false,
            converters: Arc::clone(&self.converters),
            created_at: Instant::now(),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn pattern(&self) -> ExchangePattern {
        self.pattern
    }

    pub fn set_pattern(&mut self, pattern: ExchangePattern) {
        self.pattern = pattern;
    }

    // -- messages -------------------------------------------------------------

    /// The in message.
    #[must_use]
    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn message_mut(&mut self) -> &mut Message {
        &mut self.message
    }

    pub fn set_message(&mut self, message: Message) {
        self.message = message;
    }

    /// Consumes the exchange, returning its in message.
    #[must_use]
    pub fn into_message(self) -> Message {
        self.message
    }

    #[must_use]
    pub fn out(&self) -> Option<&Message> {
        self.out.as_ref()
    }

    pub fn set_out(&mut self, message: Message) {
        self.out = Some(message);
    }

    /// Replaces the in message with the out message, if one was set.
    pub fn promote_out(&mut self) {
        if let Some(out) = self.out.take() {
            self.message = out;
        }
    }

    #[must_use]
    pub fn body(&self) -> &Value {
        self.message.body()
    }

    pub fn set_body(&mut self, body: impl Into<Value>) {
        self.message.set_body(body);
    }

    /// Reads the in body converted to `T` using this exchange's registry.
    ///
    /// # Errors
    ///
    /// See [`Message::body_as`].
    pub fn body_as<T: BodyType>(&self) -> Result<Option<T>, ConvertError> {
        self.message.body_as::<T>(&self.converters)
    }

    #[must_use]
    pub fn header(&self, key: &str) -> Option<&Value> {
        self.message.header(key)
    }

    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.message.set_header(key, value);
    }

    // -- properties -----------------------------------------------------------

    #[must_use]
    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.properties.insert(key.into(), value.into());
    }

    pub fn remove_property(&mut self, key: &str) -> Option<Value> {
        self.properties.remove(key)
    }

    /// Removes every property whose name matches `pattern` (`*` wildcards).
    pub fn remove_properties(&mut self, pattern: &str) -> usize {
        let before = self.properties.len();
        self.properties
            .retain(|key, _| !crate::pattern::wildcard_match(pattern, key));
        before - self.properties.len()
    }

    #[must_use]
    pub fn properties(&self) -> &BTreeMap<String, Value> {
        &self.properties
    }

    // -- failure --------------------------------------------------------------

    #[must_use]
    pub fn failure(&self) -> Option<&ExchangeFailure> {
        self.failure.as_ref()
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    /// Records `cause` as the failure of `step`, snapshotting the in message.
    pub fn fail(&mut self, step: impl Into<String>, cause: anyhow::Error) {
        self.failure = Some(ExchangeFailure::new(step, cause, &self.message));
    }

    pub fn set_failure(&mut self, failure: ExchangeFailure) {
        self.failure = Some(failure);
    }

    pub fn take_failure(&mut self) -> Option<ExchangeFailure> {
        self.failure.take()
    }

    // -- routing state --------------------------------------------------------

    #[must_use]
    pub fn route_id(&self) -> Option<&str> {
        self.route_id.as_deref()
    }

    pub fn set_route_id(&mut self, route_id: impl Into<String>) {
        self.route_id = Some(route_id.into());
    }

    /// Request-reply timeout for this exchange, if one was set.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = Some(timeout);
    }

    /// Whether routing was stopped (filtered out, or an explicit stop step).
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Stops routing: remaining steps are skipped.
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    /// Clears the stop flag so an enclosing block continues routing.
    pub fn resume_routing(&mut self) {
        self.stopped = false;
    }

    #[must_use]
    pub fn converters(&self) -> &Arc<TypeConverterRegistry> {
        &self.converters
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.created_at.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("order rejected")]
    struct OrderRejected;

    fn exchange() -> Exchange {
        Exchange::new(Arc::new(TypeConverterRegistry::with_defaults()))
    }

    #[test]
    fn copy_gets_new_id_and_isolated_state() {
        let mut original = exchange();
        original.set_body(Value::List(vec![Value::Int(1)]));
        original.set_property("p", "v");
        original.fail("step", anyhow::anyhow!("boom"));

        let mut copy = original.copy();
        assert_ne!(copy.id(), original.id());
        assert!(!copy.is_failed());
        copy.set_property("p", "changed");
        copy.set_body("other");

        assert_eq!(original.property("p"), Some(&Value::from("v")));
        assert_eq!(original.body(), &Value::List(vec![Value::Int(1)]));
    }

    #[test]
    fn promote_out_replaces_in_message() {
        let mut ex = exchange();
        ex.set_body("request");
        ex.set_out(Message::new("reply"));
        ex.promote_out();
        assert_eq!(ex.body(), &Value::from("reply"));
        assert!(ex.out().is_none());
    }

    #[test]
    fn failure_keeps_cause_chain_and_snapshot() {
        let mut ex = exchange();
        ex.set_body("order-1");
        ex.fail(
            "validate",
            anyhow::Error::new(OrderRejected).context("validating order"),
        );
        ex.set_body("mutated later");

        let failure = ex.failure().unwrap();
        assert_eq!(failure.step(), "validate");
        assert!(failure.is::<OrderRejected>());
        assert!(!failure.is::<std::io::Error>());
        assert_eq!(failure.snapshot().body(), &Value::from("order-1"));
        assert!(failure.to_string().contains("order rejected"));
        assert!(std::error::Error::source(failure).is_some());
    }

    #[test]
    fn body_as_uses_exchange_converters() {
        let mut ex = exchange();
        ex.set_body("41");
        assert_eq!(ex.body_as::<i64>().unwrap(), Some(41));
    }

    #[test]
    fn remove_properties_by_pattern() {
        let mut ex = exchange();
        ex.set_property("propertyToRemove1", 1);
        ex.set_property("propertyToRemove2", 2);
        ex.set_property("keep", 3);
        assert_eq!(ex.remove_properties("propertyToRemove*"), 2);
        assert_eq!(ex.properties().len(), 1);
    }
}
