//! Per-route lifecycle state machine.

use std::sync::Arc;

use anyhow::Context as _;
use arc_swap::ArcSwap;
use tokio::sync::Mutex;

use super::assembler::RouteAssembler;
use super::definition::RouteDefinition;
use super::drain::InFlightTracker;
use super::middleware::{build_route_service, RouteState};
use super::{HealthReporter, RouteHealth, RouteStats, RouteStatsSnapshot, RouteStatus};
use crate::endpoint::{Consumer, EndpointRegistry, RouteBinding};
use crate::error::EngineError;
use crate::processor::Pipeline;

/// What a started route owns.
struct RouteRuntime {
    pipeline: Pipeline,
    consumer: Box<dyn Consumer>,
    binding: RouteBinding,
    /// Set while suspended by stopping a consumer that cannot suspend.
    consumer_stopped: bool,
}

/// A route registered with a context, together with its runtime state.
///
/// Transitions are serialized by an async mutex, so concurrent calls to
/// [`start`](Self::start) and [`stop`](Self::stop) always leave the route in
/// a state one of them produced. The status itself is readable without the
/// lock.
pub struct ManagedRoute {
    definition: Arc<RouteDefinition>,
    endpoints: Arc<EndpointRegistry>,
    state: RouteState,
    health: Arc<HealthReporter>,
    runtime: Mutex<Option<RouteRuntime>>,
}

impl ManagedRoute {
    #[must_use]
    pub fn new(definition: RouteDefinition, endpoints: Arc<EndpointRegistry>) -> Self {
        let route_id = definition.id().to_string();
        Self {
            health: Arc::new(HealthReporter::new(route_id.clone())),
            state: RouteState {
                route_id,
                status: Arc::new(ArcSwap::from_pointee(RouteStatus::Stopped)),
                in_flight: Arc::new(InFlightTracker::new()),
                stats: Arc::new(RouteStats::default()),
            },
            definition: Arc::new(definition),
            endpoints,
            runtime: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.state.route_id
    }

    #[must_use]
    pub fn definition(&self) -> &Arc<RouteDefinition> {
        &self.definition
    }

    #[must_use]
    pub fn status(&self) -> RouteStatus {
        **self.state.status.load()
    }

    #[must_use]
    pub fn health(&self) -> RouteHealth {
        self.health.current()
    }

    #[must_use]
    pub fn stats(&self) -> RouteStatsSnapshot {
        self.state.stats.snapshot(self.state.in_flight.count())
    }

    fn set_status(&self, status: RouteStatus) {
        let previous = *self.state.status.swap(Arc::new(status));
        tracing::debug!(route_id = %self.id(), from = %previous, to = %status, "route status changed");
    }

    fn invalid(&self, status: RouteStatus, operation: &'static str) -> EngineError {
        EngineError::InvalidTransition {
            route_id: self.id().to_string(),
            status,
            operation,
        }
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    /// Assembles the route's processors and starts its consumer.
    ///
    /// Starting a started route is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::RouteStart`] when anything fails; the route is
    /// left `Stopped`. Returns [`EngineError::InvalidTransition`] while the
    /// route is suspended or mid-transition.
    pub async fn start(&self) -> Result<(), EngineError> {
        let mut runtime = self.runtime.lock().await;
        match self.status() {
            RouteStatus::Stopped => {}
            RouteStatus::Started => return Ok(()),
            other => return Err(self.invalid(other, "start")),
        }

        self.set_status(RouteStatus::Starting);
        match self.launch().await {
            Ok(launched) => {
                *runtime = Some(launched);
                self.set_status(RouteStatus::Started);
                tracing::info!(route_id = %self.id(), from = %self.definition.from_uri(), "route started");
                Ok(())
            }
            Err(source) => {
                self.set_status(RouteStatus::Stopped);
                Err(EngineError::RouteStart {
                    route_id: self.id().to_string(),
                    source,
                })
            }
        }
    }

    async fn launch(&self) -> anyhow::Result<RouteRuntime> {
        let assembled = RouteAssembler::new(Arc::clone(&self.endpoints)).assemble(&self.definition)?;
        assembled.pipeline.start().await?;

        let ctx = self.endpoints.context();
        let handler = build_route_service(assembled.service, &self.state, &ctx.config);
        let binding = RouteBinding {
            route_id: self.id().to_string(),
            handler: Arc::new(handler),
            health: Arc::clone(&self.health),
            converters: Arc::clone(&ctx.converters),
        };

        match self.start_consumer(binding.clone()).await {
            Ok(consumer) => Ok(RouteRuntime {
                pipeline: assembled.pipeline,
                consumer,
                binding,
                consumer_stopped: false,
            }),
            Err(err) => {
                assembled.pipeline.stop().await;
                Err(err)
            }
        }
    }

    async fn start_consumer(&self, binding: RouteBinding) -> anyhow::Result<Box<dyn Consumer>> {
        let from = self.definition.from_uri();
        let consumer = self.endpoints.resolve(from)?.create_consumer(binding)?;
        consumer
            .start()
            .await
            .with_context(|| format!("starting consumer on `{from}`"))?;
        Ok(consumer)
    }

    /// Stops the consumer, waits for in-flight exchanges up to the shutdown
    /// timeout, and stops the processors. Exchanges still running after the
    /// timeout are abandoned.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::RouteStop`] when the consumer fails to stop; the
    /// route still ends up `Stopped`.
    pub async fn stop(&self) -> Result<(), EngineError> {
        let mut runtime = self.runtime.lock().await;
        match self.status() {
            RouteStatus::Stopped => return Ok(()),
            RouteStatus::Started | RouteStatus::Suspended => {}
            other => return Err(self.invalid(other, "stop")),
        }

        self.set_status(RouteStatus::Stopping);
        let mut failure = None;
        if let Some(running) = runtime.take() {
            if !running.consumer_stopped {
                if let Err(err) = running.consumer.stop().await {
                    failure = Some(err.context("stopping consumer"));
                }
            }

            let timeout = self.endpoints.context().config.shutdown_timeout();
            if !self.state.in_flight.wait_for_drain(timeout).await {
                tracing::warn!(
                    route_id = %self.id(),
                    abandoned = self.state.in_flight.count(),
                    timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    "route stopped with exchanges still in flight"
                );
            }
            running.pipeline.stop().await;
        }
        self.set_status(RouteStatus::Stopped);
        tracing::info!(route_id = %self.id(), "route stopped");

        match failure {
            Some(source) => Err(EngineError::RouteStop {
                route_id: self.id().to_string(),
                source,
            }),
            None => Ok(()),
        }
    }

    /// Stops taking new exchanges without releasing the route's resources.
    ///
    /// Consumers that cannot suspend are stopped instead and recreated on
    /// [`resume`](Self::resume). In-flight exchanges keep running.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::RouteStop`] when the consumer fails to suspend;
    /// the route stays `Started`.
    pub async fn suspend(&self) -> Result<(), EngineError> {
        let mut runtime = self.runtime.lock().await;
        match self.status() {
            RouteStatus::Started => {}
            RouteStatus::Suspended => return Ok(()),
            other => return Err(self.invalid(other, "suspend")),
        }
        let Some(running) = runtime.as_mut() else {
            return Err(self.invalid(RouteStatus::Stopped, "suspend"));
        };

        self.set_status(RouteStatus::Suspending);
        let native = running.consumer.supports_suspension();
        let result = if native {
            running.consumer.suspend().await
        } else {
            running.consumer.stop().await
        };
        match result {
            Ok(()) => {
                running.consumer_stopped = !native;
                self.set_status(RouteStatus::Suspended);
                tracing::info!(route_id = %self.id(), native, "route suspended");
                Ok(())
            }
            Err(err) => {
                self.set_status(RouteStatus::Started);
                Err(EngineError::RouteStop {
                    route_id: self.id().to_string(),
                    source: err.context("suspending consumer"),
                })
            }
        }
    }

    /// # Errors
    ///
    /// Returns [`EngineError::RouteStart`] when the consumer fails to resume;
    /// the route stays `Suspended`.
    pub async fn resume(&self) -> Result<(), EngineError> {
        let mut runtime = self.runtime.lock().await;
        match self.status() {
            RouteStatus::Suspended => {}
            RouteStatus::Started => return Ok(()),
            other => return Err(self.invalid(other, "resume")),
        }
        let Some(running) = runtime.as_mut() else {
            return Err(self.invalid(RouteStatus::Stopped, "resume"));
        };

        self.set_status(RouteStatus::Resuming);
        let result = if running.consumer_stopped {
            match self.start_consumer(running.binding.clone()).await {
                Ok(consumer) => {
                    running.consumer = consumer;
                    running.consumer_stopped = false;
                    Ok(())
                }
                Err(err) => Err(err),
            }
        } else {
            running.consumer.resume().await
        };
        match result {
            Ok(()) => {
                self.set_status(RouteStatus::Started);
                tracing::info!(route_id = %self.id(), "route resumed");
                Ok(())
            }
            Err(source) => {
                self.set_status(RouteStatus::Suspended);
                Err(EngineError::RouteStart {
                    route_id: self.id().to_string(),
                    source,
                })
            }
        }
    }
}

impl std::fmt::Debug for ManagedRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedRoute")
            .field("id", &self.id())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use switchyard_core::Value;

    use super::*;
    use crate::component::mock::MockEndpoint;
    use crate::context::SwitchyardContext;
    use crate::route::{RouteBuilder, StepsDsl};
    use crate::template::ProducerTemplate;

    fn managed(ctx: &SwitchyardContext, builder: RouteBuilder) -> ManagedRoute {
        let definition = builder.build(ctx.endpoints()).unwrap();
        ManagedRoute::new(definition, Arc::clone(ctx.endpoints()))
    }

    #[tokio::test]
    async fn start_failure_leaves_route_stopped() {
        let ctx = SwitchyardContext::new();
        let route = managed(&ctx, RouteBuilder::from("direct:a").route_id("r").bean("missing"));

        let err = route.start().await.unwrap_err();
        assert!(matches!(err, EngineError::RouteStart { ref route_id, .. } if route_id == "r"));
        assert!(err.to_string().contains("missing"));
        assert_eq!(route.status(), RouteStatus::Stopped);
    }

    #[tokio::test]
    async fn start_stop_are_idempotent() {
        let ctx = SwitchyardContext::new();
        let route = managed(&ctx, RouteBuilder::from("direct:a").to("mock:out"));
        route.start().await.unwrap();
        route.start().await.unwrap();
        assert_eq!(route.status(), RouteStatus::Started);
        route.stop().await.unwrap();
        route.stop().await.unwrap();
        assert_eq!(route.status(), RouteStatus::Stopped);
    }

    #[tokio::test]
    async fn suspended_direct_route_rejects_then_resumes() {
        let ctx = SwitchyardContext::new();
        let route = managed(&ctx, RouteBuilder::from("direct:a").to("mock:out"));
        let template = ProducerTemplate::new(&ctx);
        route.start().await.unwrap();

        route.suspend().await.unwrap();
        assert_eq!(route.status(), RouteStatus::Suspended);
        assert!(template.send_body("direct:a", "lost").await.is_err());
        assert!(matches!(route.start().await, Err(EngineError::InvalidTransition { .. })));

        route.resume().await.unwrap();
        template.send_body("direct:a", "kept").await.unwrap();
        let out = ctx.endpoints().resolve_as::<MockEndpoint>("mock:out").unwrap();
        assert_eq!(out.received_bodies(), vec![Value::from("kept")]);
        route.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_drains_in_flight_exchanges() {
        let ctx = SwitchyardContext::new();
        let route = Arc::new(managed(
            &ctx,
            RouteBuilder::from("seda:slow").delay(Duration::from_millis(80)).to("mock:out"),
        ));
        route.start().await.unwrap();
        ProducerTemplate::new(&ctx).send_body("seda:slow", "x").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(route.stats().in_flight, 1);

        route.stop().await.unwrap();
        let out = ctx.endpoints().resolve_as::<MockEndpoint>("mock:out").unwrap();
        assert_eq!(out.received_count(), 1);
        assert_eq!(route.stats().in_flight, 0);
    }
}
