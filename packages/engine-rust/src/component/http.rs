//! `http:host:port/path` -- an axum server consumer and a reqwest producer.
//!
//! Consumers with the same `host:port` share one listener; each registers
//! its path with the listener's dispatcher. Suspending a route disables its
//! path (requests get 503) while the port stays bound. The listener shuts
//! down when its last path is removed or the component stops.

use std::any::Any;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use switchyard_core::{Exchange, ExchangePattern, Message, Value};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::endpoint::{
    Component, ComponentContext, Consumer, Endpoint, EndpointParams, Producer, RouteBinding,
};
use crate::error::EngineError;

/// Request method of an inbound request; overrides the producer's method.
pub const HTTP_METHOD: &str = "SwitchyardHttpMethod";
/// Request path of an inbound request.
pub const HTTP_PATH: &str = "SwitchyardHttpPath";
/// Raw query string of an inbound request; appended by the producer.
pub const HTTP_QUERY: &str = "SwitchyardHttpQuery";
/// Status code of a response, or the status a consumer should answer with.
pub const HTTP_RESPONSE_CODE: &str = "SwitchyardHttpResponseCode";

const PARAMETERS: &[&str] = &["httpMethod", "throwExceptionOnFailure", "maxBodySize"];
const DEFAULT_MAX_BODY: usize = 10 * 1024 * 1024;
const SERVER_STOP_GRACE: Duration = Duration::from_secs(5);

pub struct HttpComponent {
    shared: Arc<HttpShared>,
}

impl HttpComponent {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(HttpShared {
                client: reqwest::Client::new(),
                servers: DashMap::new(),
                lifecycle: tokio::sync::Mutex::new(()),
            }),
        }
    }
}

impl Default for HttpComponent {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Component for HttpComponent {
    fn parameter_names(&self) -> &[&'static str] {
        PARAMETERS
    }

    fn create_endpoint(
        &self,
        params: &EndpointParams,
        _ctx: &ComponentContext,
    ) -> Result<Arc<dyn Endpoint>, EngineError> {
        let (authority, path) = match params.path().split_once('/') {
            Some((authority, path)) => (authority, format!("/{path}")),
            None => (params.path(), "/".to_string()),
        };
        if authority.is_empty() {
            return Err(EngineError::invalid_endpoint(params.uri(), "http endpoint needs host:port"));
        }
        let method = params
            .get("httpMethod")
            .map(|raw| {
                reqwest::Method::from_bytes(raw.to_ascii_uppercase().as_bytes()).map_err(|_| {
                    EngineError::InvalidParameterValue {
                        uri: params.uri().to_string(),
                        param: "httpMethod".to_string(),
                        value: raw.to_string(),
                    }
                })
            })
            .transpose()?;
        Ok(Arc::new(HttpEndpoint {
            uri: params.uri().to_string(),
            authority: authority.to_string(),
            path,
            method,
            throw_on_failure: params.flag("throwExceptionOnFailure", true)?,
            max_body: params.parse_or("maxBodySize", DEFAULT_MAX_BODY)?,
            shared: Arc::clone(&self.shared),
        }))
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        let _guard = self.shared.lifecycle.lock().await;
        let servers: Vec<Arc<HttpServer>> = self
            .shared
            .servers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.shared.servers.clear();
        for server in servers {
            server.stop().await;
        }
        Ok(())
    }
}

struct HttpShared {
    client: reqwest::Client,
    servers: DashMap<String, Arc<HttpServer>>,
    /// Serializes binding, registering and unbinding of listeners.
    lifecycle: tokio::sync::Mutex<()>,
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct PathBinding {
    binding: RouteBinding,
    enabled: Arc<AtomicBool>,
}

#[derive(Default)]
struct Dispatcher {
    paths: DashMap<String, PathBinding>,
}

struct HttpServer {
    local_addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    shutdown: watch::Sender<bool>,
    task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl HttpServer {
    async fn bind(authority: &str, max_body: usize) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(authority)
            .await
            .map_err(|err| anyhow::Error::new(err).context(format!("binding {authority}")))?;
        let local_addr = listener.local_addr()?;
        let dispatcher = Arc::new(Dispatcher::default());

        let router = Router::new()
            .fallback(dispatch)
            .with_state(Arc::clone(&dispatcher))
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(RequestBodyLimitLayer::new(max_body)),
            );

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let stopped = async move {
                let _ = shutdown_rx.wait_for(|stop| *stop).await;
            };
            if let Err(err) = axum::serve(listener, router)
                .with_graceful_shutdown(stopped)
                .await
            {
                tracing::error!(%local_addr, error = %err, "http listener failed");
            }
        });
        tracing::info!(%local_addr, "http listener bound");

        Ok(Self {
            local_addr,
            dispatcher,
            shutdown,
            task: parking_lot::Mutex::new(Some(task)),
        })
    }

    async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if tokio::time::timeout(SERVER_STOP_GRACE, task).await.is_err() {
                tracing::warn!(local_addr = %self.local_addr, "http listener did not stop in time");
            }
        }
        tracing::info!(local_addr = %self.local_addr, "http listener stopped");
    }
}

async fn dispatch(State(dispatcher): State<Arc<Dispatcher>>, request: Request) -> Response {
    let path = request.uri().path().to_string();
    let Some(target) = dispatcher.paths.get(&path).map(|entry| entry.value().clone()) else {
        return (StatusCode::NOT_FOUND, format!("no route for {path}")).into_response();
    };
    if !target.enabled.load(Ordering::Acquire) {
        return (StatusCode::SERVICE_UNAVAILABLE, "route suspended").into_response();
    }

    let (parts, body) = request.into_parts();
    let Ok(bytes) = axum::body::to_bytes(body, usize::MAX).await else {
        return StatusCode::PAYLOAD_TOO_LARGE.into_response();
    };

    let mut message = Message::new(if bytes.is_empty() {
        Value::Null
    } else {
        Value::Bytes(bytes)
    });
    for (name, value) in &parts.headers {
        if let Ok(text) = value.to_str() {
            message.set_header(name.as_str(), text);
        }
    }
    message.set_header(HTTP_METHOD, parts.method.as_str());
    message.set_header(HTTP_PATH, path.as_str());
    if let Some(query) = parts.uri.query() {
        message.set_header(HTTP_QUERY, query);
    }

    let exchange = target.binding.new_exchange(ExchangePattern::InOut, message);
    match target.binding.deliver(exchange).await {
        Ok(mut done) => {
            done.promote_out();
            respond(&done)
        }
        Err(err) => {
            let status = match err {
                EngineError::RouteNotAccepting { .. } | EngineError::QueueFull { .. } => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                EngineError::ExchangeTimedOut { .. } => StatusCode::GATEWAY_TIMEOUT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (status, err.to_string()).into_response()
        }
    }
}

fn respond(exchange: &Exchange) -> Response {
    let requested = exchange
        .header(HTTP_RESPONSE_CODE)
        .and_then(Value::as_i64)
        .and_then(|code| u16::try_from(code).ok())
        .and_then(|code| StatusCode::from_u16(code).ok());

    if let Some(failure) = exchange.failure() {
        let status = requested.unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        return (status, failure.to_string()).into_response();
    }

    let (content_type, body) = match exchange.body() {
        Value::Null => (None, Body::empty()),
        Value::Bytes(bytes) => (Some("application/octet-stream"), Body::from(bytes.clone())),
        Value::Text(text) => (Some("text/plain; charset=utf-8"), Body::from(text.clone())),
        Value::List(_) | Value::Map(_) => match exchange.body().to_json() {
            Ok(json) => (Some("application/json"), Body::from(json.to_string())),
            Err(reason) => return (StatusCode::INTERNAL_SERVER_ERROR, reason).into_response(),
        },
        other => (Some("text/plain; charset=utf-8"), Body::from(other.to_string())),
    };

    let mut response = Response::new(body);
    *response.status_mut() = requested.unwrap_or(StatusCode::OK);
    let content_type = match exchange.header("content-type").and_then(Value::as_str) {
        Some(explicit) => HeaderValue::from_str(explicit).ok(),
        None => content_type.map(HeaderValue::from_static),
    };
    if let Some(content_type) = content_type {
        response.headers_mut().insert(header::CONTENT_TYPE, content_type);
    }
    response
}

// ---------------------------------------------------------------------------
// Endpoint
// ---------------------------------------------------------------------------

pub struct HttpEndpoint {
    uri: String,
    authority: String,
    path: String,
    method: Option<reqwest::Method>,
    throw_on_failure: bool,
    max_body: usize,
    shared: Arc<HttpShared>,
}

impl HttpEndpoint {
    /// Address the listener for this endpoint is bound to, once a route
    /// consuming from it has started.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared
            .servers
            .get(&self.authority)
            .map(|server| server.local_addr)
    }
}

impl Endpoint for HttpEndpoint {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn create_producer(&self) -> Result<Arc<dyn Producer>, EngineError> {
        Ok(Arc::new(HttpProducer {
            url: format!("http://{}{}", self.authority, self.path),
            method: self.method.clone(),
            throw_on_failure: self.throw_on_failure,
            client: self.shared.client.clone(),
        }))
    }

    fn create_consumer(&self, binding: RouteBinding) -> Result<Box<dyn Consumer>, EngineError> {
        Ok(Box::new(HttpConsumer {
            uri: self.uri.clone(),
            authority: self.authority.clone(),
            path: self.path.clone(),
            max_body: self.max_body,
            shared: Arc::clone(&self.shared),
            target: PathBinding {
                binding,
                enabled: Arc::new(AtomicBool::new(true)),
            },
        }))
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

// ---------------------------------------------------------------------------
// Consumer
// ---------------------------------------------------------------------------

struct HttpConsumer {
    uri: String,
    authority: String,
    path: String,
    max_body: usize,
    shared: Arc<HttpShared>,
    target: PathBinding,
}

#[async_trait]
impl Consumer for HttpConsumer {
    async fn start(&self) -> anyhow::Result<()> {
        let _guard = self.shared.lifecycle.lock().await;
        let existing = self
            .shared
            .servers
            .get(&self.authority)
            .map(|server| Arc::clone(server.value()));
        let server = match existing {
            Some(server) => server,
            None => {
                let server = Arc::new(HttpServer::bind(&self.authority, self.max_body).await?);
                self.shared
                    .servers
                    .insert(self.authority.clone(), Arc::clone(&server));
                server
            }
        };
        match server.dispatcher.paths.entry(self.path.clone()) {
            Entry::Occupied(existing) => anyhow::bail!(
                "`{}` already has a consumer (route `{}`)",
                self.uri,
                existing.get().binding.route_id
            ),
            Entry::Vacant(slot) => {
                self.target.enabled.store(true, Ordering::Release);
                slot.insert(self.target.clone());
            }
        }
        tracing::debug!(
            route_id = %self.target.binding.route_id,
            path = %self.path,
            "http path registered"
        );
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        let _guard = self.shared.lifecycle.lock().await;
        let Some(server) = self
            .shared
            .servers
            .get(&self.authority)
            .map(|server| Arc::clone(server.value()))
        else {
            return Ok(());
        };
        server.dispatcher.paths.remove_if(&self.path, |_, registered| {
            registered.binding.route_id == self.target.binding.route_id
        });
        if server.dispatcher.paths.is_empty() {
            self.shared.servers.remove(&self.authority);
            server.stop().await;
        }
        Ok(())
    }

    fn supports_suspension(&self) -> bool {
        true
    }

    async fn suspend(&self) -> anyhow::Result<()> {
        self.target.enabled.store(false, Ordering::Release);
        Ok(())
    }

    async fn resume(&self) -> anyhow::Result<()> {
        self.target.enabled.store(true, Ordering::Release);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Producer
// ---------------------------------------------------------------------------

struct HttpProducer {
    url: String,
    method: Option<reqwest::Method>,
    throw_on_failure: bool,
    client: reqwest::Client,
}

/// Inbound transport headers that must not be forwarded verbatim.
const HOP_HEADERS: &[&str] = &["host", "content-length", "transfer-encoding", "connection"];

impl HttpProducer {
    fn method_for(&self, exchange: &Exchange) -> reqwest::Method {
        if let Some(method) = exchange
            .header(HTTP_METHOD)
            .and_then(Value::as_str)
            .and_then(|raw| reqwest::Method::from_bytes(raw.to_ascii_uppercase().as_bytes()).ok())
        {
            return method;
        }
        match &self.method {
            Some(method) => method.clone(),
            None if exchange.body().is_null() => reqwest::Method::GET,
            None => reqwest::Method::POST,
        }
    }

    fn url_for(&self, exchange: &Exchange) -> String {
        match exchange.header(HTTP_QUERY).and_then(Value::as_str) {
            Some(query) if !query.is_empty() => format!("{}?{query}", self.url),
            _ => self.url.clone(),
        }
    }
}

#[async_trait]
impl Producer for HttpProducer {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), EngineError> {
        let url = self.url_for(exchange);
        let mut request = self.client.request(self.method_for(exchange), &url);
        for (name, value) in exchange.message().headers() {
            let lowered = name.to_ascii_lowercase();
            if name.starts_with("Switchyard") || HOP_HEADERS.contains(&lowered.as_str()) {
                continue;
            }
            if let Value::Text(text) = value {
                request = request.header(name.as_str(), text.as_str());
            }
        }
        if !exchange.body().is_null() {
            request = request.body(exchange.body_as::<Bytes>()?.unwrap_or_default());
        }

        let response = request
            .send()
            .await
            .map_err(|err| anyhow::Error::new(err).context(format!("calling {url}")))?;
        let status = response.status();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let bytes = response
            .bytes()
            .await
            .map_err(|err| anyhow::Error::new(err).context(format!("reading response from {url}")))?;

        if self.throw_on_failure && (status.is_client_error() || status.is_server_error()) {
            exchange.fail(
                format!("http({url})"),
                anyhow::anyhow!("{url} answered {status}: {}", String::from_utf8_lossy(&bytes)),
            );
            return Ok(());
        }

        let textual = content_type
            .as_deref()
            .is_some_and(|ct| ct.starts_with("text/") || ct.contains("json"));
        let body = match std::str::from_utf8(&bytes) {
            Ok(text) if textual => Value::from(text),
            _ if bytes.is_empty() => Value::Null,
            _ => Value::Bytes(bytes),
        };
        let message = exchange.message_mut();
        message.set_body(body);
        message.set_header(HTTP_RESPONSE_CODE, i64::from(status.as_u16()));
        if let Some(content_type) = content_type {
            message.set_header("content-type", content_type);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SwitchyardContext;
    use crate::route::{RouteBuilder, StepsDsl};

    async fn started(routes: Vec<RouteBuilder>) -> SwitchyardContext {
        let ctx = SwitchyardContext::new();
        ctx.add_routes(routes).await.unwrap();
        ctx.start().await.unwrap();
        ctx
    }

    fn bound_addr(ctx: &SwitchyardContext, uri: &str) -> SocketAddr {
        ctx.endpoints()
            .resolve_as::<HttpEndpoint>(uri)
            .unwrap()
            .local_addr()
            .unwrap()
    }

    #[tokio::test]
    async fn server_and_producer_round_trip() {
        let ctx = started(vec![RouteBuilder::from("http:127.0.0.1:0/echo").process(|ex| {
            let text = ex.body_as::<String>()?.unwrap_or_default();
            ex.set_body(format!("echo: {text}"));
            Ok(())
        })])
        .await;
        let addr = bound_addr(&ctx, "http:127.0.0.1:0/echo");

        let reply = ctx
            .producer_template()
            .request_body(&format!("http:{addr}/echo"), "hi")
            .await
            .unwrap();
        assert_eq!(reply, Value::from("echo: hi"));
        ctx.stop().await;
    }

    #[tokio::test]
    async fn paths_share_one_listener() {
        let ctx = started(vec![
            RouteBuilder::from("http:127.0.0.1:0/a").set_body("A"),
            RouteBuilder::from("http:127.0.0.1:0/b").set_body("B"),
        ])
        .await;
        let addr = bound_addr(&ctx, "http:127.0.0.1:0/a");
        assert_eq!(addr, bound_addr(&ctx, "http:127.0.0.1:0/b"));

        let client = reqwest::Client::new();
        let a = client.get(format!("http://{addr}/a")).send().await.unwrap();
        assert_eq!(a.text().await.unwrap(), "A");
        let missing = client.get(format!("http://{addr}/c")).send().await.unwrap();
        assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);
        ctx.stop().await;
    }

    #[tokio::test]
    async fn suspended_path_answers_503() {
        let ctx = started(vec![RouteBuilder::from("http:127.0.0.1:0/svc")
            .route_id("svc")
            .set_body("up")])
        .await;
        let url = format!("http://{}/svc", bound_addr(&ctx, "http:127.0.0.1:0/svc"));
        let client = reqwest::Client::new();

        ctx.suspend_route("svc").await.unwrap();
        let suspended = client.get(&url).send().await.unwrap();
        assert_eq!(suspended.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);

        ctx.resume_route("svc").await.unwrap();
        let resumed = client.get(&url).send().await.unwrap();
        assert_eq!(resumed.status(), reqwest::StatusCode::OK);
        ctx.stop().await;
    }

    #[tokio::test]
    async fn failures_and_explicit_status_codes() {
        let ctx = started(vec![
            RouteBuilder::from("http:127.0.0.1:0/boom")
                .process_named("explode", |_| Err(anyhow::anyhow!("kaboom"))),
            RouteBuilder::from("http:127.0.0.1:0/created")
                .set_header(HTTP_RESPONSE_CODE, Value::Int(201))
                .set_body("made"),
        ])
        .await;
        let addr = bound_addr(&ctx, "http:127.0.0.1:0/boom");
        let client = reqwest::Client::new();

        let boom = client.get(format!("http://{addr}/boom")).send().await.unwrap();
        assert_eq!(boom.status(), reqwest::StatusCode::INTERNAL_SERVER_ERROR);
        assert!(boom.text().await.unwrap().contains("kaboom"));

        let created = client.post(format!("http://{addr}/created")).send().await.unwrap();
        assert_eq!(created.status(), reqwest::StatusCode::CREATED);
        ctx.stop().await;
    }

    #[tokio::test]
    async fn producer_fails_exchange_on_error_status() {
        let ctx = started(vec![RouteBuilder::from("http:127.0.0.1:0/known").set_body("x")]).await;
        let addr = bound_addr(&ctx, "http:127.0.0.1:0/known");
        let template = ctx.producer_template();

        let err = template
            .request_body(&format!("http:{addr}/unknown"), Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ProcessingFailed { .. }));

        let lenient = template
            .request(
                &format!("http:{addr}/unknown?throwExceptionOnFailure=false"),
                template.new_exchange(ExchangePattern::InOut, Message::new(Value::Null)),
            )
            .await
            .unwrap();
        assert_eq!(lenient.header(HTTP_RESPONSE_CODE), Some(&Value::Int(404)));
        ctx.stop().await;
    }

    #[tokio::test]
    async fn listener_is_released_when_last_route_stops() {
        let ctx = started(vec![RouteBuilder::from("http:127.0.0.1:0/only").route_id("only")]).await;
        let endpoint = ctx
            .endpoints()
            .resolve_as::<HttpEndpoint>("http:127.0.0.1:0/only")
            .unwrap();
        assert!(endpoint.local_addr().is_some());
        ctx.stop_route("only").await.unwrap();
        assert!(endpoint.local_addr().is_none());
        ctx.stop().await;
    }
}
