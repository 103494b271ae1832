//! Correlation-based aggregator.
//!
//! Incoming exchanges are folded into a group per correlation key and always
//! stop routing. When a group completes (size, predicate, timeout, or forced
//! on stop) the combined exchange runs through the nested steps on its own.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use switchyard_core::{keys, Exchange, ExchangePattern, Expression, Predicate};

use super::{AggregationStrategy, Pipeline, Processor};
use crate::worker::{BackgroundRunnable, BackgroundWorker};

/// Why a group was released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletedBy {
    Size,
    Predicate,
    Timeout,
    ForceOnStop,
}

impl CompletedBy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            CompletedBy::Size => "size",
            CompletedBy::Predicate => "predicate",
            CompletedBy::Timeout => "timeout",
            CompletedBy::ForceOnStop => "forceCompletionOnStop",
        }
    }
}

/// Completion conditions; at least one must be set.
#[derive(Clone, Default)]
pub struct Completion {
    pub size: Option<usize>,
    pub predicate: Option<Predicate>,
    pub timeout: Option<Duration>,
    pub force_on_stop: bool,
}

struct Group {
    exchange: Exchange,
    size: usize,
    /// When the group last received an exchange.
    last_activity: Instant,
}

struct Groups {
    strategy: Arc<dyn AggregationStrategy>,
    completion: Completion,
    steps: Pipeline,
    open: Mutex<HashMap<String, Group>>,
}

impl Groups {
    /// Folds `incoming` into its group, returning the group if it completed.
    fn add(&self, key: &str, incoming: Exchange) -> Option<(Exchange, usize, CompletedBy)> {
        let mut open = self.open.lock();
        let (previous, size) = match open.remove(key) {
            Some(group) => (Some(group.exchange), group.size + 1),
            None => (None, 1),
        };
        let merged = self.strategy.aggregate(previous, incoming);

        let completed_by = if self.completion.size.is_some_and(|n| size >= n) {
            Some(CompletedBy::Size)
        } else if self
            .completion
            .predicate
            .as_ref()
            .is_some_and(|p| p.matches(&merged))
        {
            Some(CompletedBy::Predicate)
        } else {
            None
        };

        match completed_by {
            Some(by) => Some((merged, size, by)),
            None => {
                open.insert(
                    key.to_string(),
                    Group {
                        exchange: merged,
                        size,
                        last_activity: Instant::now(),
                    },
                );
                None
            }
        }
    }

    /// Removes groups that have been idle for at least `timeout`.
    fn take_expired(&self, timeout: Duration) -> Vec<(String, Group)> {
        let mut open = self.open.lock();
        let expired: Vec<String> = open
            .iter()
            .filter(|(_, group)| group.last_activity.elapsed() >= timeout)
            .map(|(key, _)| key.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|key| open.remove(&key).map(|group| (key, group)))
            .collect()
    }

    fn take_all(&self) -> Vec<(String, Group)> {
        self.open.lock().drain().collect()
    }

    async fn emit(&self, key: String, merged: Exchange, size: usize, by: CompletedBy) {
        let mut aggregated = merged.copy();
        aggregated.set_pattern(ExchangePattern::InOnly);
        aggregated.set_property(keys::AGGREGATED_SIZE, i64::try_from(size).unwrap_or(i64::MAX));
        aggregated.set_property(keys::AGGREGATED_CORRELATION_KEY, key.clone());
        aggregated.set_property(keys::AGGREGATED_COMPLETED_BY, by.as_str());
        tracing::debug!(
            correlation_key = %key,
            size,
            completed_by = by.as_str(),
            exchange_id = aggregated.id(),
            "aggregation group completed"
        );
        self.steps.run(&mut aggregated).await;
        if let Some(failure) = aggregated.failure() {
            tracing::error!(
                correlation_key = %key,
                exchange_id = aggregated.id(),
                %failure,
                "aggregated exchange failed"
            );
        }
    }

    async fn emit_all(&self, groups: Vec<(String, Group)>, by: CompletedBy) {
        for (key, group) in groups {
            self.emit(key, group.exchange, group.size, by).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Timeout sweeper
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum SweepTask {
    CompleteAll,
}

struct Sweeper {
    groups: Arc<Groups>,
    timeout: Option<Duration>,
}

#[async_trait]
impl BackgroundRunnable for Sweeper {
    type Task = SweepTask;

    async fn run(&mut self, task: SweepTask) {
        match task {
            SweepTask::CompleteAll => {
                let all = self.groups.take_all();
                self.groups.emit_all(all, CompletedBy::ForceOnStop).await;
            }
        }
    }

    async fn on_tick(&mut self) {
        if let Some(timeout) = self.timeout {
            let expired = self.groups.take_expired(timeout);
            self.groups.emit_all(expired, CompletedBy::Timeout).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Aggregate
// ---------------------------------------------------------------------------

pub struct Aggregate {
    correlation: Expression,
    groups: Arc<Groups>,
    sweep_interval: Duration,
    sweeper: Mutex<Option<BackgroundWorker<Sweeper>>>,
}

impl Aggregate {
    #[must_use]
    pub fn new(
        correlation: Expression,
        strategy: Arc<dyn AggregationStrategy>,
        completion: Completion,
        steps: Pipeline,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            correlation,
            groups: Arc::new(Groups {
                strategy,
                completion,
                steps,
                open: Mutex::new(HashMap::new()),
            }),
            sweep_interval,
            sweeper: Mutex::new(None),
        }
    }

    /// Number of groups waiting for completion.
    #[must_use]
    pub fn pending_groups(&self) -> usize {
        self.groups.open.lock().len()
    }
}

#[async_trait]
impl Processor for Aggregate {
    fn name(&self) -> &str {
        "aggregate"
    }

    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        let key = self.correlation.evaluate(exchange)?;
        if key.is_null() {
            anyhow::bail!("correlation key {:?} evaluated to null", self.correlation);
        }
        let key = key.to_string();

        let completed = self.groups.add(&key, exchange.clone());
        exchange.stop();
        if let Some((merged, size, by)) = completed {
            self.groups.emit(key, merged, size, by).await;
        }
        Ok(())
    }

    async fn start(&self) -> anyhow::Result<()> {
        self.groups.steps.start().await?;
        let completion = &self.groups.completion;
        if completion.timeout.is_some() || completion.force_on_stop {
            let sweeper = Sweeper {
                groups: Arc::clone(&self.groups),
                timeout: completion.timeout,
            };
            let interval = completion
                .timeout
                .map_or(self.sweep_interval, |t| t.min(self.sweep_interval));
            *self.sweeper.lock() = Some(BackgroundWorker::start(sweeper, interval));
        }
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        let worker = self.sweeper.lock().take();
        if let Some(mut worker) = worker {
            if self.groups.completion.force_on_stop {
                worker.submit(SweepTask::CompleteAll).await?;
            }
            worker.stop().await;
        }
        let abandoned = self.pending_groups();
        if abandoned > 0 {
            tracing::warn!(abandoned, "aggregator stopped with incomplete groups");
            self.groups.open.lock().clear();
        }
        self.groups.steps.stop().await;
        Ok(())
    }
}
