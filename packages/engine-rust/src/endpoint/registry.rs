use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use switchyard_core::EndpointUri;

use super::{Component, ComponentContext, Endpoint, EndpointParams};
use crate::error::EngineError;
use crate::properties::{resolve_placeholders, PropertiesSource};

/// Resolves endpoint URIs to interned endpoint instances.
///
/// Components are keyed by lowercase scheme. Endpoints are keyed by their
/// normalized URI, so `log:a?x=1&y=2` and `log:a?y=2&x=1` resolve to the same
/// instance. Concurrent first resolutions of one URI create a single
/// endpoint.
pub struct EndpointRegistry {
    components: DashMap<String, Arc<dyn Component>>,
    endpoints: DashMap<String, Arc<dyn Endpoint>>,
    ctx: ComponentContext,
    properties: Arc<dyn PropertiesSource>,
}

impl EndpointRegistry {
    #[must_use]
    pub fn new(ctx: ComponentContext, properties: Arc<dyn PropertiesSource>) -> Self {
        Self {
            components: DashMap::new(),
            endpoints: DashMap::new(),
            ctx,
            properties,
        }
    }

    /// Registers `component` for `scheme`, replacing any previous one.
    pub fn add_component(&self, scheme: &str, component: Arc<dyn Component>) {
        let scheme = scheme.to_ascii_lowercase();
        tracing::debug!(%scheme, "registered component");
        self.components.insert(scheme, component);
    }

    #[must_use]
    pub fn component(&self, scheme: &str) -> Option<Arc<dyn Component>> {
        self.components
            .get(&scheme.to_ascii_lowercase())
            .map(|c| Arc::clone(c.value()))
    }

    #[must_use]
    pub fn context(&self) -> &ComponentContext {
        &self.ctx
    }

    /// Checks that `uri` resolves to a known component and uses only
    /// parameters that component accepts, without creating the endpoint.
    /// Returns the normalized URI.
    ///
    /// # Errors
    ///
    /// Returns the same errors as [`resolve`](Self::resolve) short of
    /// endpoint creation.
    pub fn validate(&self, uri: &str) -> Result<String, EngineError> {
        let (params, _) = self.prepare(uri)?;
        Ok(params.uri().to_string())
    }

    /// Resolves `uri` to its endpoint, creating it on first use.
    ///
    /// # Errors
    ///
    /// Fails for unresolvable placeholders, malformed URIs, unknown schemes,
    /// unknown parameters, or when the component rejects the endpoint.
    pub fn resolve(&self, uri: &str) -> Result<Arc<dyn Endpoint>, EngineError> {
        let (params, component) = self.prepare(uri)?;
        if let Some(existing) = self.endpoints.get(params.uri()) {
            return Ok(Arc::clone(existing.value()));
        }
        match self.endpoints.entry(params.uri().to_string()) {
            Entry::Occupied(entry) => Ok(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                let endpoint = component.create_endpoint(&params, &self.ctx)?;
                tracing::debug!(uri = %params.uri(), "created endpoint");
                entry.insert(Arc::clone(&endpoint));
                Ok(endpoint)
            }
        }
    }

    /// Resolves `uri` and downcasts the endpoint to `E`.
    ///
    /// # Errors
    ///
    /// Fails as [`resolve`](Self::resolve) does, or when the endpoint is
    /// not an `E`.
    pub fn resolve_as<E: Endpoint>(&self, uri: &str) -> Result<Arc<E>, EngineError> {
        let endpoint = self.resolve(uri)?;
        let normalized = endpoint.uri().to_string();
        endpoint.as_any().downcast::<E>().map_err(|_| {
            EngineError::invalid_endpoint(
                &normalized,
                format!("endpoint is not a {}", std::any::type_name::<E>()),
            )
        })
    }

    /// Normalized URIs of every endpoint created so far.
    #[must_use]
    pub fn endpoint_uris(&self) -> Vec<String> {
        let mut uris: Vec<String> = self.endpoints.iter().map(|e| e.key().clone()).collect();
        uris.sort();
        uris
    }

    pub(crate) async fn shutdown_components(&self) {
        let components: Vec<(String, Arc<dyn Component>)> = self
            .components
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        for (scheme, component) in components {
            if let Err(err) = component.shutdown().await {
                tracing::warn!(%scheme, error = %err, "component shutdown failed");
            }
        }
    }

    fn prepare(&self, uri: &str) -> Result<(EndpointParams, Arc<dyn Component>), EngineError> {
        let resolved = resolve_placeholders(uri, self.properties.as_ref())?;
        let parsed = EndpointUri::parse(&resolved)?;
        let component =
            self.component(parsed.scheme())
                .ok_or_else(|| EngineError::NoSuchEndpointComponent {
                    scheme: parsed.scheme().to_string(),
                    uri: resolved.clone(),
                })?;
        let params = EndpointParams::new(parsed);
        if !component.lenient_parameters() {
            let known = component.parameter_names();
            if let Some(unknown) = params.keys().find(|key| !known.contains(key)) {
                return Err(EngineError::UnknownParameter {
                    uri: params.uri().to_string(),
                    param: unknown.to_string(),
                });
            }
        }
        Ok((params, component))
    }
}

impl std::fmt::Debug for EndpointRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointRegistry")
            .field("components", &self.components.len())
            .field("endpoints", &self.endpoints.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::any::Any;
    use std::sync::atomic::{AtomicU32, Ordering};

    use switchyard_core::TypeConverterRegistry;

    use super::*;
    use crate::bean::BeanRegistry;
    use crate::config::EngineConfig;
    use crate::endpoint::{unsupported, Consumer, Producer, RouteBinding};
    use crate::properties::MapProperties;
    use crate::registry::Registry;

    struct NullEndpoint {
        uri: String,
    }

    impl Endpoint for NullEndpoint {
        fn uri(&self) -> &str {
            &self.uri
        }

        fn create_producer(&self) -> Result<Arc<dyn Producer>, EngineError> {
            Err(unsupported(&self.uri, "producing"))
        }

        fn create_consumer(&self, _: RouteBinding) -> Result<Box<dyn Consumer>, EngineError> {
            Err(unsupported(&self.uri, "consuming"))
        }

        fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    struct CountingComponent {
        created: AtomicU32,
    }

    impl Component for CountingComponent {
        fn parameter_names(&self) -> &[&'static str] {
            &["size", "mode"]
        }

        fn create_endpoint(
            &self,
            params: &EndpointParams,
            _ctx: &ComponentContext,
        ) -> Result<Arc<dyn Endpoint>, EngineError> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(NullEndpoint {
                uri: params.uri().to_string(),
            }))
        }
    }

    fn registry() -> (EndpointRegistry, Arc<CountingComponent>) {
        let ctx = ComponentContext {
            converters: Arc::new(TypeConverterRegistry::with_defaults()),
            registry: Arc::new(Registry::new()),
            beans: Arc::new(BeanRegistry::new()),
            config: Arc::new(EngineConfig::default()),
        };
        let props = Arc::new(MapProperties::new().with("queue", "orders"));
        let registry = EndpointRegistry::new(ctx, props);
        let component = Arc::new(CountingComponent {
            created: AtomicU32::new(0),
        });
        registry.add_component("null", component.clone());
        (registry, component)
    }

    #[test]
    fn equivalent_uris_share_one_endpoint() {
        let (registry, component) = registry();
        let a = registry.resolve("null:{{queue}}?size=1&mode=x").unwrap();
        let b = registry.resolve("NULL:orders?mode=x&size=1").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(component.created.load(Ordering::SeqCst), 1);
        assert_eq!(registry.endpoint_uris(), vec!["null:orders?mode=x&size=1"]);
    }

    #[test]
    fn unknown_scheme_and_parameter_are_rejected() {
        let (registry, _) = registry();
        assert!(matches!(
            registry.resolve("nosuch:thing"),
            Err(EngineError::NoSuchEndpointComponent { scheme, .. }) if scheme == "nosuch"
        ));
        assert!(matches!(
            registry.validate("null:x?colour=red"),
            Err(EngineError::UnknownParameter { param, .. }) if param == "colour"
        ));
    }

    #[test]
    fn resolve_as_downcasts() {
        let (registry, _) = registry();
        let endpoint = registry.resolve_as::<NullEndpoint>("null:x").unwrap();
        assert_eq!(endpoint.uri(), "null:x");
    }

    #[test]
    fn concurrent_first_resolution_creates_once() {
        let (registry, component) = registry();
        let registry = Arc::new(registry);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || registry.resolve("null:shared").unwrap())
            })
            .collect();
        let endpoints: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(endpoints.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(component.created.load(Ordering::SeqCst), 1);
    }
}
