//! The routing context: owns components, endpoints, routes, and the shared
//! registries, and drives their lifecycle.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use switchyard_core::pattern::wildcard_match;
use switchyard_core::TypeConverterRegistry;

use crate::bean::{Bean, BeanRegistry};
use crate::component::mock::MockEndpoint;
use crate::component::register_builtin;
use crate::config::EngineConfig;
use crate::endpoint::{Component, ComponentContext, Endpoint, EndpointRegistry};
use crate::error::EngineError;
use crate::processor::{AggregationStrategy, SharedStrategy};
use crate::properties::{MapProperties, PropertiesSource};
use crate::registry::Registry;
use crate::route::{ManagedRoute, RouteBuilder, RouteHealth, RouteStatsSnapshot, RouteStatus};
use crate::template::ProducerTemplate;

/// A routing context.
///
/// Routes are added with [`add_routes`](Self::add_routes) and started with
/// the context. Type converters may be registered until the context starts;
/// the converter registry is sealed from then on.
pub struct SwitchyardContext {
    config: Arc<EngineConfig>,
    properties: Arc<dyn PropertiesSource>,
    endpoints: Arc<EndpointRegistry>,
    routes: RwLock<Vec<Arc<ManagedRoute>>>,
    next_route_number: AtomicU64,
    started: AtomicBool,
}

impl Default for SwitchyardContext {
    fn default() -> Self {
        Self::new()
    }
}

impl SwitchyardContext {
    /// A context with default configuration, no properties, and the built-in
    /// components registered.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    #[must_use]
    pub fn with_config(config: EngineConfig) -> Self {
        Self::with_properties(config, Arc::new(MapProperties::new()))
    }

    /// A context whose configuration is overlaid with `switchyard.*` values
    /// from `properties`, which also resolve `{{key}}` placeholders in URIs.
    #[must_use]
    pub fn with_properties(config: EngineConfig, properties: Arc<dyn PropertiesSource>) -> Self {
        let config = Arc::new(config.with_properties(properties.as_ref()));
        let ctx = ComponentContext {
            converters: Arc::new(TypeConverterRegistry::with_defaults()),
            registry: Arc::new(Registry::new()),
            beans: Arc::new(BeanRegistry::new()),
            config: Arc::clone(&config),
        };
        let endpoints = Arc::new(EndpointRegistry::new(ctx, Arc::clone(&properties)));
        register_builtin(&endpoints);
        Self {
            config,
            properties,
            endpoints,
            routes: RwLock::new(Vec::new()),
            next_route_number: AtomicU64::new(1),
            started: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    #[must_use]
    pub fn config(&self) -> &Arc<EngineConfig> {
        &self.config
    }

    #[must_use]
    pub fn properties(&self) -> &Arc<dyn PropertiesSource> {
        &self.properties
    }

    #[must_use]
    pub fn converters(&self) -> &Arc<TypeConverterRegistry> {
        &self.endpoints.context().converters
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.endpoints.context().registry
    }

    #[must_use]
    pub fn beans(&self) -> &Arc<BeanRegistry> {
        &self.endpoints.context().beans
    }

    #[must_use]
    pub fn endpoints(&self) -> &Arc<EndpointRegistry> {
        &self.endpoints
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Registers a component under `scheme`, replacing a built-in one.
    pub fn add_component(&self, scheme: &str, component: Arc<dyn Component>) {
        self.endpoints.add_component(scheme, component);
    }

    pub fn register_bean(&self, name: impl Into<String>, bean: Bean) {
        self.beans().register(name, bean);
    }

    /// Binds an aggregation strategy that routes can reference by name.
    pub fn bind_strategy(&self, name: impl Into<String>, strategy: impl AggregationStrategy + 'static) {
        self.registry().bind(name, Arc::new(SharedStrategy::new(strategy)));
    }

    // -----------------------------------------------------------------------
    // Routes
    // -----------------------------------------------------------------------

    /// Validates and adds routes. Either every route is added or none is.
    ///
    /// Routes whose id matches a configured exclude pattern are skipped.
    /// Routes without an explicit id are named `route-N`. When the context is
    /// already started, added routes with auto-startup are started.
    ///
    /// Returns the ids of the added routes.
    ///
    /// # Errors
    ///
    /// Returns the first validation error, [`EngineError::DuplicateRouteId`],
    /// or a start error for a route added to a started context. On a start
    /// error the routes of the batch already started are stopped and the
    /// whole batch is removed again.
    pub async fn add_routes<I>(&self, routes: I) -> Result<Vec<String>, EngineError>
    where
        I: IntoIterator<Item = RouteBuilder>,
    {
        let mut definitions = Vec::new();
        for builder in routes {
            let definition = builder.build(&self.endpoints)?;
            if !definition.generated_id && self.is_excluded(definition.id()) {
                tracing::info!(route_id = %definition.id(), "route excluded by pattern");
                continue;
            }
            definitions.push(definition);
        }

        let added: Vec<Arc<ManagedRoute>> = {
            let mut existing = self.routes.write();
            let mut taken: Vec<String> = existing.iter().map(|r| r.id().to_string()).collect();
            for definition in &mut definitions {
                if definition.generated_id {
                    let id = self.next_route_id(&taken);
                    definition.assign_id(id);
                } else if taken.iter().any(|id| id == definition.id()) {
                    return Err(EngineError::DuplicateRouteId(definition.id().to_string()));
                }
                taken.push(definition.id().to_string());
            }
            let added: Vec<Arc<ManagedRoute>> = definitions
                .into_iter()
                .map(|definition| Arc::new(ManagedRoute::new(definition, Arc::clone(&self.endpoints))))
                .collect();
            existing.extend(added.iter().cloned());
            added
        };

        for route in &added {
            tracing::debug!(route_id = %route.id(), from = %route.definition().from_uri(), "route added");
        }
        if self.is_started() {
            let mut started: Vec<&Arc<ManagedRoute>> = Vec::new();
            for route in added.iter().filter(|r| r.definition().auto_startup()) {
                if let Err(err) = route.start().await {
                    tracing::error!(route_id = %route.id(), error = %err, "added route failed to start");
                    for running in started.iter().rev() {
                        if let Err(stop_err) = running.stop().await {
                            tracing::warn!(route_id = %running.id(), error = %stop_err, "route stop failed");
                        }
                    }
                    self.routes
                        .write()
                        .retain(|r| !added.iter().any(|a| Arc::ptr_eq(a, r)));
                    return Err(err);
                }
                started.push(route);
            }
        }
        Ok(added.iter().map(|r| r.id().to_string()).collect())
    }

    fn is_excluded(&self, route_id: &str) -> bool {
        self.config
            .route_exclude_patterns
            .iter()
            .any(|pattern| wildcard_match(pattern, route_id))
    }

    fn next_route_id(&self, taken: &[String]) -> String {
        loop {
            let n = self.next_route_number.fetch_add(1, Ordering::Relaxed);
            let id = format!("route-{n}");
            if !taken.contains(&id) {
                return id;
            }
        }
    }

    #[must_use]
    pub fn route(&self, route_id: &str) -> Option<Arc<ManagedRoute>> {
        self.routes.read().iter().find(|r| r.id() == route_id).cloned()
    }

    fn require(&self, route_id: &str) -> Result<Arc<ManagedRoute>, EngineError> {
        self.route(route_id)
            .ok_or_else(|| EngineError::NoSuchRoute(route_id.to_string()))
    }

    /// Ids of all routes in the order they were added.
    #[must_use]
    pub fn route_ids(&self) -> Vec<String> {
        self.routes.read().iter().map(|r| r.id().to_string()).collect()
    }

    /// # Errors
    ///
    /// [`EngineError::NoSuchRoute`] or the route's start error.
    pub async fn start_route(&self, route_id: &str) -> Result<(), EngineError> {
        self.require(route_id)?.start().await
    }

    /// # Errors
    ///
    /// [`EngineError::NoSuchRoute`] or the route's stop error.
    pub async fn stop_route(&self, route_id: &str) -> Result<(), EngineError> {
        self.require(route_id)?.stop().await
    }

    /// # Errors
    ///
    /// [`EngineError::NoSuchRoute`] or the route's suspend error.
    pub async fn suspend_route(&self, route_id: &str) -> Result<(), EngineError> {
        self.require(route_id)?.suspend().await
    }

    /// # Errors
    ///
    /// [`EngineError::NoSuchRoute`] or the route's resume error.
    pub async fn resume_route(&self, route_id: &str) -> Result<(), EngineError> {
        self.require(route_id)?.resume().await
    }

    /// Stops a route and removes it from the context.
    ///
    /// # Errors
    ///
    /// [`EngineError::NoSuchRoute`] or the route's stop error, in which case
    /// the route is still removed.
    pub async fn remove_route(&self, route_id: &str) -> Result<(), EngineError> {
        let route = self.require(route_id)?;
        let stopped = route.stop().await;
        self.routes.write().retain(|r| r.id() != route_id);
        tracing::debug!(%route_id, "route removed");
        stopped
    }

    /// # Errors
    ///
    /// [`EngineError::NoSuchRoute`].
    pub fn route_status(&self, route_id: &str) -> Result<RouteStatus, EngineError> {
        Ok(self.require(route_id)?.status())
    }

    /// # Errors
    ///
    /// [`EngineError::NoSuchRoute`].
    pub fn route_health(&self, route_id: &str) -> Result<RouteHealth, EngineError> {
        Ok(self.require(route_id)?.health())
    }

    /// # Errors
    ///
    /// [`EngineError::NoSuchRoute`].
    pub fn route_stats(&self, route_id: &str) -> Result<RouteStatsSnapshot, EngineError> {
        Ok(self.require(route_id)?.stats())
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Seals the converter registry and starts every auto-startup route in
    /// the order added.
    ///
    /// # Errors
    ///
    /// Returns the first route start error. Routes started before it are
    /// stopped again and the context stays stopped.
    pub async fn start(&self) -> Result<(), EngineError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.converters().seal();

        let routes: Vec<Arc<ManagedRoute>> = self.routes.read().clone();
        let mut started: Vec<&Arc<ManagedRoute>> = Vec::new();
        for route in routes.iter().filter(|r| r.definition().auto_startup()) {
            if let Err(err) = route.start().await {
                tracing::error!(context = %self.name(), route_id = %route.id(), error = %err, "context start failed");
                for running in started.iter().rev() {
                    if let Err(stop_err) = running.stop().await {
                        tracing::warn!(route_id = %running.id(), error = %stop_err, "route stop failed");
                    }
                }
                self.started.store(false, Ordering::Release);
                return Err(err);
            }
            started.push(route);
        }
        tracing::info!(context = %self.name(), routes = started.len(), "context started");
        Ok(())
    }

    /// Stops every route in reverse order, then shuts components down.
    /// Failures are logged and do not stop the shutdown.
    pub async fn stop(&self) {
        if !self.started.swap(false, Ordering::AcqRel) {
            return;
        }
        let routes: Vec<Arc<ManagedRoute>> = self.routes.read().clone();
        for route in routes.iter().rev() {
            if let Err(err) = route.stop().await {
                tracing::warn!(route_id = %route.id(), error = %err, "route stop failed");
            }
        }
        self.endpoints.shutdown_components().await;
        tracing::info!(context = %self.name(), "context stopped");
    }

    // -----------------------------------------------------------------------
    // Endpoints
    // -----------------------------------------------------------------------

    /// # Errors
    ///
    /// See [`EndpointRegistry::resolve`].
    pub fn endpoint(&self, uri: &str) -> Result<Arc<dyn Endpoint>, EngineError> {
        self.endpoints.resolve(uri)
    }

    /// Resolves a `mock:` endpoint for assertions.
    ///
    /// # Errors
    ///
    /// Fails when `uri` is not a mock endpoint.
    pub fn mock(&self, uri: &str) -> Result<Arc<MockEndpoint>, EngineError> {
        self.endpoints.resolve_as::<MockEndpoint>(uri)
    }

    #[must_use]
    pub fn producer_template(&self) -> ProducerTemplate {
        ProducerTemplate::new(self)
    }
}

impl std::fmt::Debug for SwitchyardContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwitchyardContext")
            .field("name", &self.config.name)
            .field("routes", &self.route_ids())
            .field("started", &self.is_started())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use switchyard_core::Value;

    use super::*;
    use crate::route::StepsDsl;

    #[tokio::test]
    async fn generated_ids_are_numbered() {
        let ctx = SwitchyardContext::new();
        let ids = ctx
            .add_routes([
                RouteBuilder::from("direct:a").to("mock:a"),
                RouteBuilder::from("direct:b").route_id("route-2").to("mock:b"),
                RouteBuilder::from("direct:c").to("mock:c"),
            ])
            .await
            .unwrap();
        assert_eq!(ids, vec!["route-1", "route-2", "route-3"]);
    }

    #[tokio::test]
    async fn duplicate_ids_reject_the_whole_batch() {
        let ctx = SwitchyardContext::new();
        ctx.add_routes([RouteBuilder::from("direct:a").route_id("orders")])
            .await
            .unwrap();
        let err = ctx
            .add_routes([
                RouteBuilder::from("direct:b").route_id("fresh"),
                RouteBuilder::from("direct:c").route_id("orders"),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::DuplicateRouteId(id) if id == "orders"));
        assert_eq!(ctx.route_ids(), vec!["orders"]);
    }

    #[tokio::test]
    async fn exclude_patterns_skip_routes() {
        let config = EngineConfig {
            route_exclude_patterns: vec!["debug-*".to_string()],
            ..EngineConfig::default()
        };
        let ctx = SwitchyardContext::with_config(config);
        let ids = ctx
            .add_routes([
                RouteBuilder::from("direct:a").route_id("debug-dump"),
                RouteBuilder::from("direct:b").route_id("orders"),
            ])
            .await
            .unwrap();
        assert_eq!(ids, vec!["orders"]);
    }

    #[tokio::test]
    async fn start_rolls_back_on_failure() {
        let ctx = SwitchyardContext::new();
        ctx.add_routes([
            RouteBuilder::from("direct:ok").route_id("ok").to("mock:ok"),
            RouteBuilder::from("direct:bad").route_id("bad").bean("nope"),
        ])
        .await
        .unwrap();

        let err = ctx.start().await.unwrap_err();
        assert!(matches!(err, EngineError::RouteStart { ref route_id, .. } if route_id == "bad"));
        assert_eq!(ctx.route_status("ok").unwrap(), RouteStatus::Stopped);
        assert!(!ctx.is_started());
    }

    #[tokio::test]
    async fn converters_are_sealed_on_start() {
        let ctx = SwitchyardContext::new();
        ctx.start().await.unwrap();
        assert!(ctx.converters().is_sealed());
        ctx.stop().await;
    }

    #[tokio::test]
    async fn routes_added_after_start_are_started() {
        let ctx = SwitchyardContext::new();
        ctx.start().await.unwrap();
        ctx.add_routes([RouteBuilder::from("direct:late").route_id("late").set_body("seen").to("mock:late")])
            .await
            .unwrap();
        assert_eq!(ctx.route_status("late").unwrap(), RouteStatus::Started);

        ctx.producer_template().send_body("direct:late", "x").await.unwrap();
        assert_eq!(ctx.mock("mock:late").unwrap().received_bodies(), vec![Value::from("seen")]);
        ctx.stop().await;
        assert_eq!(ctx.route_status("late").unwrap(), RouteStatus::Stopped);
    }

    #[tokio::test]
    async fn failed_start_on_a_started_context_removes_the_batch() {
        let ctx = SwitchyardContext::new();
        ctx.add_routes([RouteBuilder::from("direct:a").route_id("orders").to("mock:a")])
            .await
            .unwrap();
        ctx.start().await.unwrap();

        let err = ctx
            .add_routes([
                RouteBuilder::from("direct:fresh").route_id("fresh").to("mock:fresh"),
                RouteBuilder::from("direct:bad").route_id("bad").bean("nope"),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::RouteStart { ref route_id, .. } if route_id == "bad"));
        assert_eq!(ctx.route_ids(), vec!["orders"]);
        assert!(ctx.producer_template().send_body("direct:fresh", "x").await.is_err());

        ctx.add_routes([RouteBuilder::from("direct:fresh").route_id("fresh").to("mock:fresh")])
            .await
            .unwrap();
        assert_eq!(ctx.route_status("fresh").unwrap(), RouteStatus::Started);
        ctx.stop().await;
    }

    #[tokio::test]
    async fn unknown_routes_are_reported() {
        let ctx = SwitchyardContext::new();
        assert!(matches!(
            ctx.start_route("ghost").await,
            Err(EngineError::NoSuchRoute(id)) if id == "ghost"
        ));
        assert!(ctx.route_stats("ghost").is_err());
    }
}
