//! The header-based wire protocol shared by every fabric component.
//!
//! Commands travel as plain HTTP requests: the verb is selected by the
//! `yamf-command` header, targets and routing data ride in the other
//! `yamf-*` headers, and the body is one of JSON, plain text, or raw bytes.

use axum::body::Body;
use axum::http::{HeaderMap, StatusCode, header::CONTENT_TYPE};
use axum::response::Response;
use serde_json::Value;

use crate::error::YamfError;

/// Header names. Lowercase, stable `yamf-` prefix.
pub mod header {
    /// Selects the verb.
    pub const COMMAND: &str = "yamf-command";
    /// Target service name.
    pub const SERVICE_NAME: &str = "yamf-service-name";
    /// Concrete `scheme://host:port` of a service instance.
    pub const SERVICE_LOCATION: &str = "yamf-service-location";
    /// `scheme://host` (no port), the key for port allocation.
    pub const SERVICE_HOME: &str = "yamf-service-home";
    /// Route registration: URL path.
    pub const ROUTE_PATH: &str = "yamf-route-path";
    /// Route registration: declared payload type.
    pub const ROUTE_DATATYPE: &str = "yamf-route-datatype";
    /// Route registration: `exact` or `controller`.
    pub const ROUTE_TYPE: &str = "yamf-route-type";
    /// Pub/sub channel name.
    pub const PUBSUB_CHANNEL: &str = "yamf-pubsub-channel";
    /// End-user token for a service call.
    pub const AUTH_TOKEN: &str = "yamf-auth-token";
    /// Internal trust token for protected commands.
    pub const REGISTRY_TOKEN: &str = "yamf-registry-token";
    /// Associates a service with an auth-service at registration time.
    pub const USE_AUTH_SERVICE: &str = "yamf-use-auth-service";
}

/// Every verb understood by the fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Health,
    ServiceSetup,
    ServiceRegister,
    ServiceUnregister,
    ServiceLookup,
    ServiceCall,
    RouteRegister,
    PubsubPublish,
    PubsubSubscribe,
    PubsubUnsubscribe,
    RegistryPull,
    RegistryUpdated,
    GatewayPull,
    CacheUpdate,
    AuthLogin,
    AuthRefresh,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Health => "health",
            Command::ServiceSetup => "service-setup",
            Command::ServiceRegister => "service-register",
            Command::ServiceUnregister => "service-unregister",
            Command::ServiceLookup => "service-lookup",
            Command::ServiceCall => "service-call",
            Command::RouteRegister => "route-register",
            Command::PubsubPublish => "pubsub-publish",
            Command::PubsubSubscribe => "pubsub-subscribe",
            Command::PubsubUnsubscribe => "pubsub-unsubscribe",
            Command::RegistryPull => "registry-pull",
            Command::RegistryUpdated => "registry-updated",
            Command::GatewayPull => "gateway-pull",
            Command::CacheUpdate => "cache-update",
            Command::AuthLogin => "auth-login",
            Command::AuthRefresh => "auth-refresh",
        }
    }

    pub fn parse(value: &str) -> Option<Command> {
        match value {
            "health" => Some(Command::Health),
            "service-setup" => Some(Command::ServiceSetup),
            "service-register" => Some(Command::ServiceRegister),
            "service-unregister" => Some(Command::ServiceUnregister),
            "service-lookup" => Some(Command::ServiceLookup),
            "service-call" => Some(Command::ServiceCall),
            "route-register" => Some(Command::RouteRegister),
            "pubsub-publish" => Some(Command::PubsubPublish),
            "pubsub-subscribe" => Some(Command::PubsubSubscribe),
            "pubsub-unsubscribe" => Some(Command::PubsubUnsubscribe),
            "registry-pull" => Some(Command::RegistryPull),
            "registry-updated" => Some(Command::RegistryUpdated),
            "gateway-pull" => Some(Command::GatewayPull),
            "cache-update" => Some(Command::CacheUpdate),
            "auth-login" => Some(Command::AuthLogin),
            "auth-refresh" => Some(Command::AuthRefresh),
            _ => None,
        }
    }

    /// Public commands need no registry token. Everything else is protected.
    pub fn is_public(&self) -> bool {
        matches!(
            self,
            Command::Health
                | Command::ServiceLookup
                | Command::ServiceCall
                | Command::AuthLogin
                | Command::AuthRefresh
        )
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read the command header from a request, if present and recognized.
pub fn command_of(headers: &HeaderMap) -> Option<Command> {
    headers
        .get(header::COMMAND)
        .and_then(|v| v.to_str().ok())
        .and_then(Command::parse)
}

/// Read a required `yamf-*` header as a string.
pub fn require_header(headers: &HeaderMap, name: &str) -> crate::Result<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| YamfError::Validation(format!("missing required header '{name}'")))
}

/// Read an optional `yamf-*` header as a string.
pub fn optional_header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// A request or response body with a deterministic content type.
///
/// Replaces runtime type inference with an explicit variant: the content
/// type is a function of the variant, never of inspection.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Objects, arrays, numbers, booleans, null — `application/json`.
    Json(Value),
    /// Non-empty strings — `text/plain`.
    Text(String),
    /// Raw bytes — `application/octet-stream`.
    Binary(Vec<u8>),
    /// No body at all.
    Empty,
}

impl Payload {
    pub fn content_type(&self) -> Option<&'static str> {
        match self {
            Payload::Json(_) => Some("application/json"),
            Payload::Text(_) => Some("text/plain; charset=utf-8"),
            Payload::Binary(_) => Some("application/octet-stream"),
            Payload::Empty => None,
        }
    }

    /// Serialize to the bytes that travel on the wire.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Payload::Json(value) => serde_json::to_vec(value).unwrap_or_default(),
            Payload::Text(text) => text.as_bytes().to_vec(),
            Payload::Binary(bytes) => bytes.clone(),
            Payload::Empty => Vec::new(),
        }
    }

    /// Decode from wire bytes and the declared content type.
    ///
    /// An empty body is `Empty` regardless of content type. Without a
    /// content type, valid UTF-8 is treated as text and anything else as
    /// binary — never JSON, so the decode stays deterministic.
    pub fn decode(content_type: Option<&str>, bytes: &[u8]) -> crate::Result<Payload> {
        if bytes.is_empty() {
            return Ok(Payload::Empty);
        }
        match content_type {
            Some(ct) if ct.starts_with("application/json") => serde_json::from_slice(bytes)
                .map(Payload::Json)
                .map_err(|e| YamfError::Validation(format!("invalid JSON body: {e}"))),
            Some(ct) if ct.starts_with("text/") => String::from_utf8(bytes.to_vec())
                .map(Payload::Text)
                .map_err(|e| YamfError::Validation(format!("invalid UTF-8 text body: {e}"))),
            Some(ct) if ct.starts_with("application/octet-stream") => {
                Ok(Payload::Binary(bytes.to_vec()))
            }
            _ => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => Ok(Payload::Text(text)),
                Err(raw) => Ok(Payload::Binary(raw.into_bytes())),
            },
        }
    }

    /// Render as a 200 HTTP response with the matching content type.
    pub fn into_response(self) -> Response {
        let mut builder = Response::builder().status(StatusCode::OK);
        if let Some(ct) = self.content_type() {
            builder = builder.header(CONTENT_TYPE, ct);
        }
        builder
            .body(Body::from(self.to_bytes()))
            .unwrap_or_else(|_| Response::new(Body::empty()))
    }

    /// The JSON value, if this payload is JSON.
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Payload::Json(value) => Some(value),
            _ => None,
        }
    }

    /// The text content, if this payload is text.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text),
            _ => None,
        }
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Json(value)
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        if text.is_empty() {
            Payload::Empty
        } else {
            Payload::Text(text)
        }
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Binary(bytes)
    }
}

/// Buffer and decode a command request body.
pub async fn read_payload(request: axum::extract::Request) -> crate::Result<Payload> {
    let content_type = request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let bytes = axum::body::to_bytes(request.into_body(), usize::MAX)
        .await
        .map_err(|e| YamfError::Validation(format!("failed to read request body: {e}")))?;
    Payload::decode(content_type.as_deref(), &bytes)
}

/// Milliseconds since the unix epoch, for health and pull timestamps.
pub fn unix_timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
