//! `timer:name` -- fires an empty exchange every `period` milliseconds.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use switchyard_core::{ExchangePattern, Message, Value};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::endpoint::{
    unsupported, Component, ComponentContext, Consumer, Endpoint, EndpointParams, Producer,
    RouteBinding,
};
use crate::error::EngineError;

/// Property carrying the timer's name.
pub const TIMER_NAME: &str = "SwitchyardTimerName";
/// Property carrying the 1-based fire count.
pub const TIMER_COUNTER: &str = "SwitchyardTimerCounter";
/// Property carrying the fire time in epoch milliseconds.
pub const TIMER_FIRED_TIME: &str = "SwitchyardTimerFiredTime";

const PARAMETERS: &[&str] = &["period", "delay", "repeatCount"];

pub struct TimerComponent;

#[async_trait]
impl Component for TimerComponent {
    fn parameter_names(&self) -> &[&'static str] {
        PARAMETERS
    }

    fn create_endpoint(
        &self,
        params: &EndpointParams,
        _ctx: &ComponentContext,
    ) -> Result<Arc<dyn Endpoint>, EngineError> {
        let period = params.millis("period", 1000)?;
        if period.is_zero() {
            return Err(EngineError::invalid_endpoint(params.uri(), "period must be positive"));
        }
        Ok(Arc::new(TimerEndpoint {
            uri: params.uri().to_string(),
            settings: TimerSettings {
                name: params.path().to_string(),
                period,
                delay: params.millis("delay", 1000)?,
                repeat_count: params.parse_or("repeatCount", 0u64)?,
            },
        }))
    }
}

#[derive(Debug, Clone)]
struct TimerSettings {
    name: String,
    period: Duration,
    delay: Duration,
    /// Zero fires forever.
    repeat_count: u64,
}

pub struct TimerEndpoint {
    uri: String,
    settings: TimerSettings,
}

impl Endpoint for TimerEndpoint {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn create_producer(&self) -> Result<Arc<dyn Producer>, EngineError> {
        Err(unsupported(&self.uri, "producing"))
    }

    fn create_consumer(&self, binding: RouteBinding) -> Result<Box<dyn Consumer>, EngineError> {
        Ok(Box::new(TimerConsumer {
            settings: self.settings.clone(),
            binding,
            paused: Arc::new(AtomicBool::new(false)),
            cancel: Mutex::new(None),
        }))
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

struct TimerConsumer {
    settings: TimerSettings,
    binding: RouteBinding,
    paused: Arc<AtomicBool>,
    cancel: Mutex<Option<CancellationToken>>,
}

fn epoch_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}

async fn fire(
    settings: TimerSettings,
    binding: RouteBinding,
    paused: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    tokio::select! {
        () = cancel.cancelled() => return,
        () = tokio::time::sleep(settings.delay) => {}
    }
    let mut ticks = tokio::time::interval(settings.period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut counter: u64 = 0;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticks.tick() => {}
        }
        if paused.load(Ordering::Acquire) {
            continue;
        }
        counter += 1;
        let mut exchange = binding.new_exchange(ExchangePattern::InOnly, Message::new(Value::Null));
        exchange.set_property(TIMER_NAME, settings.name.as_str());
        exchange.set_property(TIMER_COUNTER, i64::try_from(counter).unwrap_or(i64::MAX));
        exchange.set_property(TIMER_FIRED_TIME, epoch_millis());
        binding.deliver_logged(exchange).await;

        if settings.repeat_count != 0 && counter >= settings.repeat_count {
            tracing::debug!(route_id = %binding.route_id, timer = %settings.name, counter, "timer finished");
            break;
        }
    }
}

#[async_trait]
impl Consumer for TimerConsumer {
    async fn start(&self) -> anyhow::Result<()> {
        let mut slot = self.cancel.lock();
        if slot.is_some() {
            return Ok(());
        }
        let token = CancellationToken::new();
        self.paused.store(false, Ordering::Release);
        tokio::spawn(fire(
            self.settings.clone(),
            self.binding.clone(),
            Arc::clone(&self.paused),
            token.clone(),
        ));
        *slot = Some(token);
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        if let Some(token) = self.cancel.lock().take() {
            token.cancel();
        }
        Ok(())
    }

    fn supports_suspension(&self) -> bool {
        true
    }

    async fn suspend(&self) -> anyhow::Result<()> {
        self.paused.store(true, Ordering::Release);
        Ok(())
    }

    async fn resume(&self) -> anyhow::Result<()> {
        self.paused.store(false, Ordering::Release);
        Ok(())
    }
}

impl Drop for TimerConsumer {
    fn drop(&mut self) {
        if let Some(token) = self.cancel.get_mut().take() {
            token.cancel();
        }
    }
}
