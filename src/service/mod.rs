//! The service runtime embedded in every fabric service.
//!
//! Gives application code one entry point: register a named async handler,
//! receive RPC calls and pub/sub messages, call other services through a
//! [`Context`], and clean up with a graceful terminate. The runtime owns
//! port allocation (with collision retry), registration, the local
//! directory cache, and request classification by command header.

pub mod cache;
pub mod context;
pub mod pubsub;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use axum::Router;
use axum::extract::{Request, State};
use axum::response::Response;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::client::FabricClient;
use crate::config::FabricConfig;
use crate::error::YamfError;
use crate::naming;
use crate::registry::state::DirectorySnapshot;
use crate::wire::{self, Command, Payload, header, unix_timestamp_ms};

pub use cache::{CacheUpdate, DirectoryCache};
pub use context::Context;
pub use pubsub::{SubscriptionHandler, SubscriptionManager, subscription_handler};

/// What a handler hands back to the runtime.
pub enum Outcome {
    /// Serialize by payload kind and send with 200.
    Reply(Payload),
    /// A fully formed HTTP response; the runtime sends it untouched.
    Response(Response),
}

impl From<Payload> for Outcome {
    fn from(payload: Payload) -> Self {
        Outcome::Reply(payload)
    }
}

impl From<Value> for Outcome {
    fn from(value: Value) -> Self {
        Outcome::Reply(Payload::Json(value))
    }
}

impl From<String> for Outcome {
    fn from(text: String) -> Self {
        Outcome::Reply(Payload::from(text))
    }
}

impl From<Vec<u8>> for Outcome {
    fn from(bytes: Vec<u8>) -> Self {
        Outcome::Reply(Payload::Binary(bytes))
    }
}

impl From<()> for Outcome {
    fn from(_: ()) -> Self {
        Outcome::Reply(Payload::Empty)
    }
}

impl From<Response> for Outcome {
    fn from(response: Response) -> Self {
        Outcome::Response(response)
    }
}

/// Boxed future returned by an application handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = crate::Result<Outcome>> + Send>>;

/// Type-erased application handler: `(payload, context) -> outcome`.
pub type ServiceHandler = Arc<dyn Fn(Payload, Context) -> HandlerFuture + Send + Sync>;

/// Wrap an async closure as a [`ServiceHandler`]. The closure may return
/// anything convertible into an [`Outcome`] — a JSON value, a string, raw
/// bytes, a [`Payload`], or a raw HTTP response.
pub fn handler<F, Fut, T>(f: F) -> ServiceHandler
where
    F: Fn(Payload, Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = crate::Result<T>> + Send + 'static,
    T: Into<Outcome> + 'static,
{
    Arc::new(move |payload, context| -> HandlerFuture {
        let fut = f(payload, context);
        Box::pin(async move { fut.await.map(Into::into) })
    })
}

/// What a `before` preprocessor hands back to the runtime.
pub enum BeforeOutcome {
    /// Keep going: the (possibly transformed) payload reaches the handler.
    Continue(Payload),
    /// Stop: this outcome is the response; the handler never runs.
    Done(Outcome),
}

/// Boxed future returned by a `before` hook.
pub type BeforeFuture = Pin<Box<dyn Future<Output = crate::Result<BeforeOutcome>> + Send>>;

/// The single replaceable preprocessor slot of an RPC service.
pub type BeforeHook = Arc<dyn Fn(Payload, Context) -> BeforeFuture + Send + Sync>;

/// Wrap an async closure as a [`BeforeHook`].
pub fn before_hook<F, Fut>(f: F) -> BeforeHook
where
    F: Fn(Payload, Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = crate::Result<BeforeOutcome>> + Send + 'static,
{
    Arc::new(move |payload, context| -> BeforeFuture { Box::pin(f(payload, context)) })
}

/// Startup options beyond name and handler.
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub config: FabricConfig,
    /// Name of the auth-service that guards calls routed via the registry.
    pub auth_service: Option<String>,
}

impl ServiceOptions {
    pub fn new(config: FabricConfig) -> Self {
        ServiceOptions { config, auth_service: None }
    }

    pub fn with_auth_service(mut self, name: impl Into<String>) -> Self {
        self.auth_service = Some(name.into());
        self
    }
}

/// Shared state of one running service instance.
pub(crate) struct ServiceInner {
    pub(crate) name: String,
    pub(crate) location: String,
    pub(crate) cache: DirectoryCache,
    pub(crate) subscriptions: SubscriptionManager,
    pub(crate) before: RwLock<Option<BeforeHook>>,
    pub(crate) handler: ServiceHandler,
    pub(crate) client: FabricClient,
    pub(crate) config: FabricConfig,
}

/// A running, registered service. Dropping the handle does not stop the
/// server; call [`Service::terminate`] for a clean exit.
pub struct Service {
    inner: Arc<ServiceInner>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Service {
    /// Start a service: validate the name, obtain a location from the
    /// registry, bind (re-requesting on port collisions), serve, register,
    /// and seed the local cache from the registration response.
    pub async fn start(
        name: &str,
        handler: ServiceHandler,
        options: ServiceOptions,
    ) -> crate::Result<Service> {
        naming::validate_service_name(name)?;
        let config = options.config;
        let client = FabricClient::new(config.clone())?;

        let home = match &config.service_url {
            Some(url) => naming::home_of(url)?,
            None => naming::home_of(&config.registry_url)?,
        };

        let (listener, location) = acquire_listener(&client, name, &home).await?;

        let inner = Arc::new(ServiceInner {
            name: name.to_string(),
            location: location.clone(),
            cache: DirectoryCache::new(),
            subscriptions: SubscriptionManager::new(),
            before: RwLock::new(None),
            handler,
            client: client.clone(),
            config,
        });

        let app = Router::new()
            .fallback(handle_request)
            .with_state(inner.clone());

        let cancel = CancellationToken::new();
        let serve_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(serve_cancel.cancelled_owned())
                .await;
            if let Err(e) = result {
                tracing::error!(error = %e, "service server error");
            }
        });

        let service = Service { inner, cancel, task };
        if let Err(e) = service.register(options.auth_service.as_deref()).await {
            tracing::warn!(service = %name, error = %e, "registration failed, shutting down");
            service.cancel.cancel();
            let _ = service.task.await;
            return Err(e);
        }
        tracing::info!(service = %name, location = %location, "service started");
        Ok(service)
    }

    async fn register(&self, auth_service: Option<&str>) -> crate::Result<()> {
        let mut headers = vec![
            (header::SERVICE_NAME, self.inner.name.as_str()),
            (header::SERVICE_LOCATION, self.inner.location.as_str()),
        ];
        if let Some(auth) = auth_service {
            headers.push((header::USE_AUTH_SERVICE, auth));
        }
        let response = self
            .inner
            .client
            .with_retry(|| async {
                self.inner
                    .client
                    .registry_command(Command::ServiceRegister, &headers, &Payload::Empty)
                    .await
            })
            .await?;

        let Payload::Json(body) = response else {
            return Err(YamfError::Internal(
                "service-register returned a non-JSON body".to_string(),
            ));
        };
        let snapshot: DirectorySnapshot = serde_json::from_value(body)
            .map_err(|e| YamfError::Internal(format!("malformed registration snapshot: {e}")))?;
        self.inner.cache.seed(snapshot).await;
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn location(&self) -> &str {
        &self.inner.location
    }

    pub fn cache(&self) -> &DirectoryCache {
        &self.inner.cache
    }

    pub fn context(&self) -> Context {
        Context { inner: self.inner.clone() }
    }

    /// Install (or replace) the single `before` preprocessor. It runs ahead
    /// of the application handler on every RPC request and may transform
    /// the payload or answer by itself.
    pub async fn before(&self, hook: BeforeHook) {
        *self.inner.before.write().await = Some(hook);
    }

    pub(crate) async fn subscribe_channel(
        &self,
        channel: &str,
        handler: SubscriptionHandler,
    ) -> crate::Result<String> {
        let (sub_id, first) = self.inner.subscriptions.add(channel, handler).await;
        if first {
            let result = self
                .inner
                .client
                .registry_command(
                    Command::PubsubSubscribe,
                    &[
                        (header::PUBSUB_CHANNEL, channel),
                        (header::SERVICE_LOCATION, &self.inner.location),
                    ],
                    &Payload::Empty,
                )
                .await;
            if let Err(e) = result {
                // Keep local and registry views consistent.
                self.inner.subscriptions.remove(channel, &sub_id).await;
                return Err(e);
            }
        }
        Ok(sub_id)
    }

    pub(crate) async fn unsubscribe_channel(
        &self,
        channel: &str,
        sub_id: &str,
    ) -> crate::Result<()> {
        let (removed, last) = self.inner.subscriptions.remove(channel, sub_id).await;
        if !removed {
            return Err(YamfError::NotFound(format!(
                "no subscription '{sub_id}' on channel '{channel}'"
            )));
        }
        if last {
            self.inner
                .client
                .registry_command(
                    Command::PubsubUnsubscribe,
                    &[
                        (header::PUBSUB_CHANNEL, channel),
                        (header::SERVICE_LOCATION, &self.inner.location),
                    ],
                    &Payload::Empty,
                )
                .await?;
        }
        Ok(())
    }

    /// Graceful shutdown: unsubscribe every channel, unregister, stop
    /// accepting connections, drain in-flight requests. Registry failures
    /// here are logged, not raised — the process is going away regardless.
    pub async fn terminate(self) {
        for channel in self.inner.subscriptions.channels().await {
            let result = self
                .inner
                .client
                .registry_command(
                    Command::PubsubUnsubscribe,
                    &[
                        (header::PUBSUB_CHANNEL, &channel),
                        (header::SERVICE_LOCATION, &self.inner.location),
                    ],
                    &Payload::Empty,
                )
                .await;
            if let Err(e) = result {
                tracing::debug!(channel = %channel, error = %e, "unsubscribe during terminate failed");
            }
        }

        let result = self
            .inner
            .client
            .registry_command(
                Command::ServiceUnregister,
                &[
                    (header::SERVICE_NAME, &self.inner.name),
                    (header::SERVICE_LOCATION, &self.inner.location),
                ],
                &Payload::Empty,
            )
            .await;
        if let Err(e) = result {
            tracing::warn!(service = %self.inner.name, error = %e, "unregister during terminate failed");
        }

        self.cancel.cancel();
        let _ = self.task.await;
        tracing::info!(service = %self.inner.name, "service terminated");
    }
}

/// Obtain a location from the registry and bind it, re-requesting a fresh
/// port on address collisions (a race with processes outside the fabric).
async fn acquire_listener(
    client: &FabricClient,
    name: &str,
    home: &str,
) -> crate::Result<(TcpListener, String)> {
    let limit = client.config().registration_retry_limit.max(1);
    let mut attempts = 0;
    loop {
        let location = client
            .with_retry(|| async {
                client
                    .registry_command(
                        Command::ServiceSetup,
                        &[(header::SERVICE_NAME, name), (header::SERVICE_HOME, home)],
                        &Payload::Empty,
                    )
                    .await
            })
            .await?;
        let location = location
            .as_text()
            .ok_or_else(|| {
                YamfError::Internal("service-setup returned a non-text body".to_string())
            })?
            .to_string();
        let (_, port) = naming::split_location(&location)?;

        match bind_home(home, port).await {
            Ok(listener) => return Ok((listener, location)),
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                attempts += 1;
                if attempts >= limit {
                    return Err(YamfError::Unavailable(format!(
                        "no bindable port for '{name}' after {attempts} allocations"
                    )));
                }
                tracing::debug!(service = %name, port, "allocated port already bound, re-requesting");
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Bind the allocated port on the home's address when it is a literal IP;
/// hostname homes listen on the wildcard.
async fn bind_home(home: &str, port: u16) -> std::io::Result<TcpListener> {
    let host = home.split_once("://").map(|(_, h)| h).unwrap_or(home);
    let host = host.trim_start_matches('[').trim_end_matches(']');
    match host.parse::<std::net::IpAddr>() {
        Ok(ip) => TcpListener::bind((ip, port)).await,
        Err(_) => TcpListener::bind(("0.0.0.0", port)).await,
    }
}

/// A dedicated service that does nothing but dispatch pub/sub messages.
/// Its RPC handler rejects everything that is not a `pubsub-publish`.
pub struct SubscriptionService {
    service: Service,
}

impl SubscriptionService {
    /// Start with an initial channel → handler set (may be empty, or a
    /// single pair for the common case).
    pub async fn start(
        name: &str,
        channels: Vec<(String, SubscriptionHandler)>,
        options: ServiceOptions,
    ) -> crate::Result<SubscriptionService> {
        let reject: ServiceHandler = Arc::new(|_payload, context| -> HandlerFuture {
            Box::pin(async move {
                Err(YamfError::Validation(format!(
                    "service '{}' only accepts pubsub-publish",
                    context.service_name()
                )))
            })
        });

        let service = Service::start(name, reject, options).await?;
        for (channel, handler) in channels {
            if let Err(e) = service.subscribe_channel(&channel, handler).await {
                service.terminate().await;
                return Err(e);
            }
        }
        Ok(SubscriptionService { service })
    }

    /// Add a handler; first handler on a channel subscribes with the registry.
    pub async fn subscribe(
        &self,
        channel: &str,
        handler: SubscriptionHandler,
    ) -> crate::Result<String> {
        self.service.subscribe_channel(channel, handler).await
    }

    /// Remove a handler; the last one on a channel unsubscribes.
    pub async fn unsubscribe(&self, channel: &str, sub_id: &str) -> crate::Result<()> {
        self.service.unsubscribe_channel(channel, sub_id).await
    }

    pub fn location(&self) -> &str {
        self.service.location()
    }

    pub fn context(&self) -> Context {
        self.service.context()
    }

    pub async fn terminate(self) {
        self.service.terminate().await
    }
}

/// Classify an incoming request by command header and route it to the
/// cache, the subscription manager, or the application handler.
async fn service_dispatch(inner: &Arc<ServiceInner>, request: Request) -> crate::Result<Response> {
    match wire::command_of(request.headers()) {
        Some(Command::CacheUpdate) => {
            let Payload::Json(body) = wire::read_payload(request).await? else {
                return Err(YamfError::Validation(
                    "cache-update requires a JSON body".to_string(),
                ));
            };
            let update: CacheUpdate = serde_json::from_value(body)
                .map_err(|e| YamfError::Validation(format!("malformed cache-update: {e}")))?;
            inner.cache.apply(&update).await;
            Ok(Payload::Empty.into_response())
        }
        Some(Command::PubsubPublish) => {
            let channel = wire::require_header(request.headers(), header::PUBSUB_CHANNEL)?;
            let message = wire::read_payload(request).await?;
            let outcome = inner.subscriptions.dispatch(&channel, &message).await;
            Ok(outcome.into_payload().into_response())
        }
        Some(Command::Health) => Ok(Payload::Json(json!({
            "status": "ready",
            "timestamp": unix_timestamp_ms(),
        }))
        .into_response()),
        None | Some(Command::ServiceCall) => {
            let payload = wire::read_payload(request).await?;
            let context = Context { inner: inner.clone() };

            let before = inner.before.read().await.clone();
            let payload = match before {
                Some(hook) => match hook(payload, context.clone()).await? {
                    BeforeOutcome::Continue(transformed) => transformed,
                    BeforeOutcome::Done(outcome) => return Ok(render(outcome)),
                },
                None => payload,
            };

            let outcome = (inner.handler)(payload, context).await?;
            Ok(render(outcome))
        }
        Some(other) => Err(YamfError::Validation(format!(
            "command '{other}' is not served by a service"
        ))),
    }
}

fn render(outcome: Outcome) -> Response {
    match outcome {
        Outcome::Reply(payload) => payload.into_response(),
        Outcome::Response(response) => response,
    }
}

async fn handle_request(State(inner): State<Arc<ServiceInner>>, request: Request) -> Response {
    let redact = inner.config.environment.is_production_like();
    match service_dispatch(&inner, request).await {
        Ok(response) => response,
        Err(e) => {
            tracing::debug!(service = %inner.name, error = %e, "request failed");
            e.into_response_redacted(redact)
        }
    }
}
