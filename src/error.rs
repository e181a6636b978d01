//! Error types for YAMF fabric operations.
//!
//! Every failure in the fabric maps to exactly one variant and one HTTP
//! status, so errors survive a hop across process boundaries: a handler's
//! error is rendered as a `{status, message}` JSON body, and the caller's
//! runtime re-raises the matching variant from that body.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Main error type for fabric operations.
#[derive(Error, Debug)]
pub enum YamfError {
    /// Bad input: empty name, invalid characters, invalid URL, missing header
    #[error("{0}")]
    Validation(String),

    /// Missing or invalid end-user auth token
    #[error("{0}")]
    Auth(String),

    /// Missing or invalid registry token on a protected command
    #[error("{0}")]
    Forbidden(String),

    /// No such service, route, or subscription
    #[error("{0}")]
    NotFound(String),

    /// Upstream call timed out
    #[error("{0}")]
    Timeout(String),

    /// Upstream failure during a proxy, before response headers were sent
    #[error("{0}")]
    Proxy(String),

    /// Transient reach failure: registry down, auth service down, target down
    #[error("{0}")]
    Unavailable(String),

    /// Everything else
    #[error("{0}")]
    Internal(String),
}

impl YamfError {
    /// HTTP status this error surfaces as.
    pub fn status(&self) -> StatusCode {
        match self {
            YamfError::Validation(_) => StatusCode::BAD_REQUEST,
            YamfError::Auth(_) => StatusCode::UNAUTHORIZED,
            YamfError::Forbidden(_) => StatusCode::FORBIDDEN,
            YamfError::NotFound(_) => StatusCode::NOT_FOUND,
            YamfError::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            YamfError::Proxy(_) => StatusCode::BAD_GATEWAY,
            YamfError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            YamfError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Rebuild the variant matching a remote `{status, message}` error body.
    ///
    /// Unknown statuses collapse to `Internal` so a misbehaving peer cannot
    /// produce an unrepresentable error.
    pub fn from_status(status: StatusCode, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            StatusCode::BAD_REQUEST => YamfError::Validation(message),
            StatusCode::UNAUTHORIZED => YamfError::Auth(message),
            StatusCode::FORBIDDEN => YamfError::Forbidden(message),
            StatusCode::NOT_FOUND => YamfError::NotFound(message),
            StatusCode::REQUEST_TIMEOUT => YamfError::Timeout(message),
            StatusCode::BAD_GATEWAY => YamfError::Proxy(message),
            StatusCode::SERVICE_UNAVAILABLE => YamfError::Unavailable(message),
            _ => YamfError::Internal(message),
        }
    }

    /// True when a caller may retry after a backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, YamfError::Unavailable(_) | YamfError::Timeout(_))
    }

    /// Render as a `{status, message}` JSON response.
    ///
    /// With `redact` set, `Internal` messages are replaced by a generic
    /// string so internals never leak from production deployments.
    pub fn into_response_redacted(self, redact: bool) -> Response {
        let status = self.status();
        let message = match (&self, redact) {
            (YamfError::Internal(_), true) => "internal error".to_string(),
            _ => self.to_string(),
        };
        let body = serde_json::json!({
            "status": status.as_u16(),
            "message": message,
        });
        (status, Json(body)).into_response()
    }
}

impl IntoResponse for YamfError {
    fn into_response(self) -> Response {
        self.into_response_redacted(false)
    }
}

impl From<std::io::Error> for YamfError {
    fn from(err: std::io::Error) -> Self {
        YamfError::Internal(err.to_string())
    }
}

impl From<reqwest::Error> for YamfError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            YamfError::Timeout(err.to_string())
        } else if err.is_connect() {
            YamfError::Unavailable(err.to_string())
        } else {
            YamfError::Internal(err.to_string())
        }
    }
}

/// Result type alias for fabric operations.
pub type Result<T> = std::result::Result<T, YamfError>;
