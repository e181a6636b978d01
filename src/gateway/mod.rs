//! The gateway process — the fabric's public HTTP edge.
//!
//! Owns no authoritative state. Its view of the registry is a snapshot
//! replaced atomically after each `registry-pull`; the `registry-updated`
//! notification from the registry is a trigger only, never a state carrier.
//! Incoming requests are either header commands or route lookups that
//! stream-proxy to a registered service.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::HeaderMap;
use axum::response::Response;
use serde_json::json;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::balance;
use crate::client::FabricClient;
use crate::config::FabricConfig;
use crate::error::YamfError;
use crate::registry::GATEWAY_SERVICE_NAME;
use crate::registry::state::{ServiceMetadata, Snapshot};
use crate::wire::{self, Command, Payload, header, unix_timestamp_ms};

/// The gateway's pulled view of registry state.
#[derive(Debug, Default)]
struct GatewayView {
    snapshot: Snapshot,
    pulled_at: u64,
}

/// The gateway process state shared by all request handlers.
pub struct Gateway {
    view: RwLock<GatewayView>,
    client: FabricClient,
    config: FabricConfig,
    /// This gateway's public base URL (registered with the registry).
    location: String,
}

/// Handle to a running gateway server.
pub struct GatewayHandle {
    pub addr: SocketAddr,
    pub location: String,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl GatewayHandle {
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Stop accepting connections and wait for the serve task to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

impl Gateway {
    /// Bind `bind_addr`, register with the registry as a pull-only public
    /// service, warm the local view with one pull, then serve until
    /// `cancel` fires.
    pub async fn start(
        config: FabricConfig,
        bind_addr: &str,
        cancel: CancellationToken,
    ) -> crate::Result<GatewayHandle> {
        let listener = tokio::net::TcpListener::bind(bind_addr)
            .await
            .map_err(|e| YamfError::Internal(format!("failed to bind gateway to {bind_addr}: {e}")))?;
        let addr = listener
            .local_addr()
            .map_err(|e| YamfError::Internal(e.to_string()))?;
        let location = config
            .gateway_url
            .clone()
            .unwrap_or_else(|| format!("http://{addr}"));

        let gateway = Arc::new(Gateway {
            view: RwLock::new(GatewayView::default()),
            client: FabricClient::new(config.clone())?,
            config,
            location: location.clone(),
        });

        gateway.register_self().await?;
        gateway.pull().await?;

        let app = Router::new()
            .fallback(handle_request)
            .with_state(gateway);

        tracing::info!(addr = %addr, location = %location, "gateway listening");

        let serve_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(serve_cancel.cancelled_owned())
            .await;
            if let Err(e) = result {
                tracing::error!(error = %e, "gateway server error");
            }
        });

        Ok(GatewayHandle { addr, location, cancel, task })
    }

    /// Register as `yamf-gateway`: pull-only (never pushed state), public,
    /// preregistered (no allocated port). Retries with linear backoff in
    /// case the registry is still coming up.
    async fn register_self(&self) -> crate::Result<()> {
        let metadata = ServiceMetadata {
            pull_only: true,
            public: true,
            preregistered: true,
            service_type: Some("gateway".to_string()),
            registered_at: 0,
        };
        let body = Payload::Json(
            serde_json::to_value(&metadata).map_err(|e| YamfError::Internal(e.to_string()))?,
        );
        self.client
            .with_retry(|| async {
                self.client
                    .registry_command(
                        Command::ServiceRegister,
                        &[
                            (header::SERVICE_NAME, GATEWAY_SERVICE_NAME),
                            (header::SERVICE_LOCATION, &self.location),
                        ],
                        &body,
                    )
                    .await
            })
            .await?;
        tracing::info!(location = %self.location, "gateway registered with registry");
        Ok(())
    }

    /// Pull the full registry state and atomically replace the local view.
    async fn pull(&self) -> crate::Result<(usize, usize)> {
        let payload = self
            .client
            .registry_command(Command::RegistryPull, &[], &Payload::Empty)
            .await?;
        let Payload::Json(body) = payload else {
            return Err(YamfError::Internal(
                "registry-pull returned a non-JSON body".to_string(),
            ));
        };
        let snapshot: Snapshot = serde_json::from_value(body)
            .map_err(|e| YamfError::Internal(format!("malformed registry snapshot: {e}")))?;
        let services = snapshot.services.len();
        let routes = snapshot.route_count();

        let mut view = self.view.write().await;
        *view = GatewayView { snapshot, pulled_at: unix_timestamp_ms() };
        drop(view);

        tracing::debug!(services, routes, "gateway view refreshed");
        Ok((services, routes))
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

    async fn dispatch(&self, peer: SocketAddr, request: Request) -> crate::Result<Response> {
        match wire::command_of(request.headers()) {
            Some(Command::Health) => Ok(Payload::Json(json!({
                "status": "ready",
                "timestamp": unix_timestamp_ms(),
            }))
            .into_response()),
            Some(Command::RegistryUpdated) => {
                self.check_token(request.headers())?;
                self.registry_updated().await
            }
            Some(Command::GatewayPull) => {
                self.check_token(request.headers())?;
                self.gateway_pull().await
            }
            Some(Command::AuthLogin) | Some(Command::AuthRefresh) => {
                // Forwarded to the registry, which selects the auth service.
                Ok(crate::proxy::proxy_request(
                    self.client.http(),
                    &self.config.registry_url,
                    request,
                    &peer.to_string(),
                    &self.location,
                )
                .await)
            }
            // Anything else — including unrecognized commands — resolves as
            // a route against the pulled view.
            _ => self.proxy_route(peer, request).await,
        }
    }

    /// `registry-updated`: the one-bit notification. Ignore the body, pull
    /// the full state, answer with a view summary.
    async fn registry_updated(&self) -> crate::Result<Response> {
        let (services, routes) = self.pull().await.map_err(|e| {
            YamfError::Unavailable(format!("registry pull after update notification failed: {e}"))
        })?;
        Ok(Payload::Json(json!({
            "status": "ok",
            "servicesCount": services,
            "routesCount": routes,
            "timestamp": unix_timestamp_ms(),
        }))
        .into_response())
    }

    /// Dev-only introspection of the local view. Disabled wholesale in
    /// production-like environments.
    async fn gateway_pull(&self) -> crate::Result<Response> {
        if self.config.environment.is_production_like() {
            return Err(YamfError::NotFound(
                "gateway-pull is not available in this environment".to_string(),
            ));
        }
        let view = self.view.read().await;
        let body = json!({
            "snapshot": serde_json::to_value(&view.snapshot)
                .map_err(|e| YamfError::Internal(e.to_string()))?,
            "pulledAt": view.pulled_at,
        });
        Ok(Payload::Json(body).into_response())
    }

    async fn proxy_route(&self, peer: SocketAddr, request: Request) -> crate::Result<Response> {
        let path = request.uri().path().to_string();
        let target = {
            let view = self.view.read().await;
            let Some(service) = view.snapshot.resolve_route(&path) else {
                return Err(YamfError::NotFound(format!("no route matches '{path}'")));
            };
            let locations = view
                .snapshot
                .services
                .get(service)
                .cloned()
                .unwrap_or_default();
            balance::pick_random(service, &locations)?.to_string()
        };

        tracing::debug!(path = %path, target = %target, "proxying route");
        Ok(crate::proxy::proxy_request(
            self.client.http(),
            &target,
            request,
            &peer.to_string(),
            &self.location,
        )
        .await)
    }
}

async fn handle_request(
    State(gateway): State<Arc<Gateway>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    let redact = gateway.config.environment.is_production_like();
    match gateway.dispatch(peer, request).await {
        Ok(response) => response,
        Err(e) => {
            tracing::debug!(error = %e, "gateway request failed");
            e.into_response_redacted(redact)
        }
    }
}
