//! The registry process — single source of truth for the fabric.
//!
//! One HTTP entry point: every request carries a `yamf-command` header and
//! is dispatched from a single fallback handler. Mutations are in-memory
//! and atomic per command behind one mutex; broadcasts (cache updates to
//! services, the `registry-updated` nudge to the gateway) run as
//! fire-and-forget tasks so a dead recipient never blocks a response.

pub mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::HeaderMap;
use axum::response::Response;
use futures::future::join_all;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::balance::Strategy;
use crate::client::FabricClient;
use crate::config::FabricConfig;
use crate::error::YamfError;
use crate::naming;
use crate::proxy;
use crate::wire::{self, Command, Payload, header, unix_timestamp_ms};

use state::{RegistryState, ServiceMetadata};

/// The name under which the gateway registers itself.
pub const GATEWAY_SERVICE_NAME: &str = "yamf-gateway";

/// The registry process state shared by all request handlers.
pub struct Registry {
    state: Mutex<RegistryState>,
    client: FabricClient,
    config: FabricConfig,
    /// This registry's own base URL, used as the `by` hop when proxying.
    location: String,
}

/// Handle to a running registry server.
pub struct RegistryHandle {
    pub addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl RegistryHandle {
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Stop accepting connections and wait for the serve task to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

impl Registry {
    /// Bind `bind_addr` (port 0 allowed) and serve the command endpoint
    /// until `cancel` fires.
    ///
    /// Refuses to start in production-like environments without a
    /// configured registry token.
    pub async fn start(
        config: FabricConfig,
        bind_addr: &str,
        cancel: CancellationToken,
    ) -> crate::Result<RegistryHandle> {
        config.validate_for_registry()?;

        let listener = tokio::net::TcpListener::bind(bind_addr)
            .await
            .map_err(|e| YamfError::Internal(format!("failed to bind registry to {bind_addr}: {e}")))?;
        let addr = listener
            .local_addr()
            .map_err(|e| YamfError::Internal(e.to_string()))?;

        let registry = Arc::new(Registry {
            state: Mutex::new(RegistryState::default()),
            client: FabricClient::new(config.clone())?,
            config,
            location: format!("http://{addr}"),
        });

        let app = Router::new()
            .fallback(handle_request)
            .with_state(registry);

        tracing::info!(addr = %addr, "registry listening");

        let serve_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(serve_cancel.cancelled_owned())
            .await;
            if let Err(e) = result {
                tracing::error!(error = %e, "registry server error");
            }
        });

        Ok(RegistryHandle { addr, cancel, task })
    }

    fn check_token(&self, headers: &HeaderMap) -> crate::Result<()> {
        let Some(expected) = self.config.token() else {
            return Ok(());
        };
        match headers.get(header::REGISTRY_TOKEN).and_then(|v| v.to_str().ok()) {
            None => Err(YamfError::Forbidden("Registry token required".to_string())),
            Some(got) if got != expected => {
                Err(YamfError::Forbidden("Invalid registry token".to_string()))
            }
            Some(_) => Ok(()),
        }
    }

    async fn dispatch(
        &self,
        peer: SocketAddr,
        request: Request,
    ) -> crate::Result<Response> {
        let command = wire::command_of(request.headers()).ok_or_else(|| {
            YamfError::Validation("missing or unrecognized yamf-command header".to_string())
        })?;
        if !command.is_public() {
            self.check_token(request.headers())?;
        }

        match command {
            Command::Health => Ok(Payload::Json(json!({
                "status": "ready",
                "timestamp": unix_timestamp_ms(),
            }))
            .into_response()),
            Command::ServiceSetup => self.service_setup(request.headers()).await,
            Command::ServiceRegister => self.service_register(request).await,
            Command::ServiceUnregister => self.service_unregister(request.headers()).await,
            Command::ServiceLookup => self.service_lookup(request.headers()).await,
            Command::ServiceCall => self.service_call(peer, request).await,
            Command::RouteRegister => self.route_register(request.headers()).await,
            Command::PubsubPublish => self.pubsub_publish(request).await,
            Command::PubsubSubscribe => self.pubsub_subscribe(request.headers(), true).await,
            Command::PubsubUnsubscribe => self.pubsub_subscribe(request.headers(), false).await,
            Command::RegistryPull => self.registry_pull().await,
            Command::AuthLogin | Command::AuthRefresh => self.auth_passthrough(peer, request).await,
            // The registry holds the authoritative maps; a cache-update
            // addressed to it carries nothing to apply.
            Command::CacheUpdate => Ok(Payload::Empty.into_response()),
            Command::RegistryUpdated | Command::GatewayPull => Err(YamfError::Validation(format!(
                "command '{command}' is not served by the registry"
            ))),
        }
    }

    async fn service_setup(&self, headers: &HeaderMap) -> crate::Result<Response> {
        let name = wire::require_header(headers, header::SERVICE_NAME)?;
        naming::validate_service_name(&name)?;
        let home = wire::require_header(headers, header::SERVICE_HOME)?;
        let home = naming::home_of(&home)?;

        let port = self.state.lock().await.allocate_port(&home);
        let location = format!("{home}:{port}");
        tracing::debug!(service = %name, location = %location, "allocated service location");
        Ok(Payload::Text(location).into_response())
    }

    async fn service_register(&self, request: Request) -> crate::Result<Response> {
        let headers = request.headers().clone();
        let name = wire::require_header(&headers, header::SERVICE_NAME)?;
        naming::validate_service_name(&name)?;
        let location = wire::require_header(&headers, header::SERVICE_LOCATION)?;
        naming::split_location(&location)?;
        let auth_service = wire::optional_header(&headers, header::USE_AUTH_SERVICE);

        // Optional JSON body carries registration metadata (the gateway
        // registers itself as pull-only/public/preregistered this way).
        let metadata = match wire::read_payload(request).await? {
            Payload::Json(value) => serde_json::from_value::<ServiceMetadata>(value)
                .map_err(|e| YamfError::Validation(format!("invalid registration metadata: {e}")))?,
            Payload::Empty => ServiceMetadata::default(),
            _ => return Err(YamfError::Validation(
                "registration metadata must be a JSON object".to_string(),
            )),
        };

        let (snapshot, targets, gateway) = {
            let mut state = self.state.lock().await;
            state.register(&name, &location, auth_service, metadata);
            (
                state.directory_snapshot(),
                state.broadcast_targets(&location),
                state.select(GATEWAY_SERVICE_NAME, Strategy::Random).ok(),
            )
        };
        tracing::info!(service = %name, location = %location, "service registered");

        self.broadcast_cache_update("register", &name, &location, targets);
        self.notify_gateway(gateway);

        let body = serde_json::to_value(&snapshot)
            .map_err(|e| YamfError::Internal(e.to_string()))?;
        Ok(Payload::Json(body).into_response())
    }

    async fn service_unregister(&self, headers: &HeaderMap) -> crate::Result<Response> {
        let name = wire::require_header(headers, header::SERVICE_NAME)?;
        let location = wire::require_header(headers, header::SERVICE_LOCATION)?;

        let (targets, gateway) = {
            let mut state = self.state.lock().await;
            state.unregister(&name, &location);
            (
                state.broadcast_targets(&location),
                state.select(GATEWAY_SERVICE_NAME, Strategy::Random).ok(),
            )
        };
        tracing::info!(service = %name, location = %location, "service unregistered");

        self.broadcast_cache_update("unregister", &name, &location, targets);
        self.notify_gateway(gateway);
        Ok(Payload::Empty.into_response())
    }

    async fn service_lookup(&self, headers: &HeaderMap) -> crate::Result<Response> {
        let name = wire::require_header(headers, header::SERVICE_NAME)?;
        if name == "*" {
            let services = self.state.lock().await.services_map();
            let body = serde_json::to_value(services)
                .map_err(|e| YamfError::Internal(e.to_string()))?;
            return Ok(Payload::Json(body).into_response());
        }
        let location = self.state.lock().await.select(&name, Strategy::Random)?;
        Ok(Payload::Text(location).into_response())
    }

    async fn service_call(&self, peer: SocketAddr, request: Request) -> crate::Result<Response> {
        let name = wire::require_header(request.headers(), header::SERVICE_NAME)?;
        let auth_token = wire::optional_header(request.headers(), header::AUTH_TOKEN);

        let auth_service = self.state.lock().await.auth_service_of(&name);
        if let Some(auth_service) = auth_service {
            self.verify_auth(&auth_service, auth_token).await?;
        }

        let location = self.state.lock().await.select(&name, Strategy::RoundRobin)?;
        tracing::debug!(service = %name, location = %location, "proxying service call");
        Ok(proxy::proxy_request(
            self.client.http(),
            &location,
            request,
            &peer.to_string(),
            &self.location,
        )
        .await)
    }

    /// Verify an end-user token against the auth-service guarding a target.
    ///
    /// A non-error response whose body lacks an `error` field counts as
    /// verified. Missing/invalid tokens are 401; an unreachable or
    /// unregistered auth service is 503; anything else is 500.
    async fn verify_auth(&self, auth_service: &str, token: Option<String>) -> crate::Result<()> {
        let token = token.ok_or_else(|| YamfError::Auth("auth token required".to_string()))?;

        let location = match self
            .state
            .lock()
            .await
            .select(auth_service, Strategy::RoundRobin)
        {
            Ok(location) => location,
            Err(YamfError::NotFound(_)) => {
                return Err(YamfError::Unavailable(format!(
                    "auth service '{auth_service}' is not registered"
                )));
            }
            Err(e) => return Err(e),
        };

        let payload = Payload::Json(json!({ "verifyAccess": token }));
        let result = self
            .client
            .command(
                &location,
                Command::ServiceCall,
                &[(header::SERVICE_NAME, auth_service)],
                &payload,
            )
            .await;
        match result {
            Ok(response) => {
                let rejected = response
                    .as_json()
                    .map(|body| body.get("error").is_some())
                    .unwrap_or(false);
                if rejected {
                    Err(YamfError::Auth("invalid auth token".to_string()))
                } else {
                    Ok(())
                }
            }
            Err(YamfError::Auth(message)) => Err(YamfError::Auth(message)),
            Err(e) if e.is_retryable() => Err(YamfError::Unavailable(format!(
                "auth service '{auth_service}' unreachable: {e}"
            ))),
            Err(e) => Err(YamfError::Internal(format!("auth verification failed: {e}"))),
        }
    }

    async fn route_register(&self, headers: &HeaderMap) -> crate::Result<Response> {
        let name = wire::require_header(headers, header::SERVICE_NAME)?;
        naming::validate_service_name(&name)?;
        let path = wire::require_header(headers, header::ROUTE_PATH)?;
        if !path.starts_with('/') {
            return Err(YamfError::Validation(format!(
                "route path '{path}' must start with '/'"
            )));
        }
        let data_type = wire::optional_header(headers, header::ROUTE_DATATYPE);
        let route_type = wire::optional_header(headers, header::ROUTE_TYPE);

        let gateway = {
            let mut state = self.state.lock().await;
            state.register_route(&path, &name, data_type, route_type.as_deref());
            state.select(GATEWAY_SERVICE_NAME, Strategy::Random).ok()
        };
        tracing::info!(service = %name, path = %path, "route registered");

        self.notify_gateway(gateway);
        Ok(Payload::Json(json!({"status": "ok", "path": path, "service": name})).into_response())
    }

    async fn pubsub_publish(&self, request: Request) -> crate::Result<Response> {
        let channel = wire::require_header(request.headers(), header::PUBSUB_CHANNEL)?;
        let message = wire::read_payload(request).await?;

        let subscribers = self.state.lock().await.subscribers(&channel);
        tracing::debug!(channel = %channel, subscribers = subscribers.len(), "publishing");

        let deliveries = subscribers.iter().map(|location| {
            let client = self.client.clone();
            let channel = channel.clone();
            let message = message.clone();
            let location = location.clone();
            async move {
                let result = client
                    .command(
                        &location,
                        Command::PubsubPublish,
                        &[(header::PUBSUB_CHANNEL, &channel)],
                        &message,
                    )
                    .await;
                (location, result)
            }
        });

        let mut results: Vec<Value> = Vec::new();
        let mut errors: Vec<Value> = Vec::new();
        for (location, delivery) in join_all(deliveries).await {
            match delivery {
                Ok(Payload::Json(body)) => {
                    // A fabric subscriber answers with its own per-handler
                    // aggregate; flatten it into ours.
                    let is_aggregate = body.get("results").is_some() || body.get("errors").is_some();
                    if is_aggregate {
                        if let Some(Value::Array(inner)) = body.get("results") {
                            results.extend(inner.iter().cloned());
                        }
                        if let Some(Value::Array(inner)) = body.get("errors") {
                            errors.extend(inner.iter().cloned());
                        }
                    } else {
                        results.push(body);
                    }
                }
                Ok(Payload::Text(text)) => results.push(Value::String(text)),
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(location = %location, error = %e, "publish delivery failed");
                    errors.push(json!({
                        "subId": location,
                        "error": e.to_string(),
                        "status": e.status().as_u16(),
                    }));
                }
            }
        }

        Ok(Payload::Json(json!({"results": results, "errors": errors})).into_response())
    }

    async fn pubsub_subscribe(
        &self,
        headers: &HeaderMap,
        subscribe: bool,
    ) -> crate::Result<Response> {
        let channel = wire::require_header(headers, header::PUBSUB_CHANNEL)?;
        let location = wire::require_header(headers, header::SERVICE_LOCATION)?;
        naming::split_location(&location)?;

        let mut state = self.state.lock().await;
        if subscribe {
            state.subscribe(&channel, &location);
        } else {
            state.unsubscribe(&channel, &location);
        }
        drop(state);

        tracing::debug!(
            channel = %channel,
            location = %location,
            subscribed = subscribe,
            "subscription updated"
        );
        Ok(Payload::Json(json!({"status": "ok", "channel": channel})).into_response())
    }

    async fn registry_pull(&self) -> crate::Result<Response> {
        let snapshot = self.state.lock().await.snapshot();
        let body = serde_json::to_value(&snapshot)
            .map_err(|e| YamfError::Internal(e.to_string()))?;
        Ok(Payload::Json(body).into_response())
    }

    /// `auth-login` / `auth-refresh`: public pass-through to the named
    /// auth-service. The registry does not interpret the body.
    async fn auth_passthrough(&self, peer: SocketAddr, request: Request) -> crate::Result<Response> {
        let name = wire::require_header(request.headers(), header::SERVICE_NAME)?;
        let location = self.state.lock().await.select(&name, Strategy::RoundRobin)?;
        Ok(proxy::proxy_request(
            self.client.http(),
            &location,
            request,
            &peer.to_string(),
            &self.location,
        )
        .await)
    }

    /// Fire-and-forget cache-update fan-out. Delivery failures are logged
    /// and discarded; a dead recipient never blocks the mutation response.
    fn broadcast_cache_update(
        &self,
        action: &'static str,
        service: &str,
        location: &str,
        targets: Vec<String>,
    ) {
        if targets.is_empty() {
            return;
        }
        let body = Payload::Json(json!({
            "action": action,
            "service": service,
            "location": location,
        }));
        for target in targets {
            let client = self.client.clone();
            let body = body.clone();
            tokio::spawn(async move {
                if let Err(e) = client.command(&target, Command::CacheUpdate, &[], &body).await {
                    tracing::debug!(target = %target, error = %e, "cache-update delivery failed");
                }
            });
        }
    }

    /// Nudge the gateway to pull. The notification is a trigger, not state:
    /// the gateway answers by issuing `registry-pull` back to us.
    fn notify_gateway(&self, registered_gateway: Option<String>) {
        let Some(gateway) = registered_gateway.or_else(|| self.config.gateway_url.clone()) else {
            return;
        };
        let client = self.client.clone();
        let token = self.config.token().map(str::to_string);
        tokio::spawn(async move {
            let mut headers: Vec<(&str, &str)> = Vec::new();
            if let Some(token) = token.as_deref() {
                headers.push((header::REGISTRY_TOKEN, token));
            }
            if let Err(e) = client
                .command(&gateway, Command::RegistryUpdated, &headers, &Payload::Empty)
                .await
            {
                tracing::debug!(gateway = %gateway, error = %e, "registry-updated notification failed");
            }
        });
    }
}

async fn handle_request(
    State(registry): State<Arc<Registry>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    let redact = registry.config.environment.is_production_like();
    match registry.dispatch(peer, request).await {
        Ok(response) => response,
        Err(e) => {
            tracing::debug!(error = %e, "registry command failed");
            e.into_response_redacted(redact)
        }
    }
}
