//! Outbound HTTP for fabric processes.
//!
//! One `reqwest::Client` per process, wrapped with the command-header
//! protocol, payload encoding, typed error unwrapping, and the linear
//! backoff retry used throughout service setup.

use std::future::Future;
use std::time::Duration;

use axum::http::StatusCode;

use crate::config::FabricConfig;
use crate::error::YamfError;
use crate::wire::{Command, Payload, header};

/// Default outbound HTTP timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared outbound client for one fabric process.
#[derive(Debug, Clone)]
pub struct FabricClient {
    http: reqwest::Client,
    config: FabricConfig,
}

impl FabricClient {
    pub fn new(config: FabricConfig) -> crate::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| YamfError::Internal(format!("failed to build HTTP client: {e}")))?;
        Ok(FabricClient { http, config })
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn config(&self) -> &FabricConfig {
        &self.config
    }

    /// POST a command to an arbitrary base URL.
    ///
    /// `headers` are extra `yamf-*` pairs; the command header and the
    /// payload's content type are set automatically. Error bodies of the
    /// `{status, message}` shape are re-raised as their typed variant.
    pub async fn command(
        &self,
        base_url: &str,
        command: Command,
        headers: &[(&str, &str)],
        payload: &Payload,
    ) -> crate::Result<Payload> {
        let mut request = self
            .http
            .post(base_url)
            .header(header::COMMAND, command.as_str());
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        if let Some(content_type) = payload.content_type() {
            request = request.header(reqwest::header::CONTENT_TYPE, content_type);
        }
        let response = request.body(payload.to_bytes()).send().await?;
        Self::decode_response(response).await
    }

    /// POST a command to the configured registry, carrying the registry
    /// token when one is configured.
    pub async fn registry_command(
        &self,
        command: Command,
        headers: &[(&str, &str)],
        payload: &Payload,
    ) -> crate::Result<Payload> {
        let mut all: Vec<(&str, &str)> = headers.to_vec();
        if let Some(token) = self.config.token() {
            all.push((header::REGISTRY_TOKEN, token));
        }
        let registry_url = self.config.registry_url.clone();
        self.command(&registry_url, command, &all, payload).await
    }

    async fn decode_response(response: reqwest::Response) -> crate::Result<Payload> {
        let status = response.status();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = response.bytes().await?;
        if status.is_success() {
            return Payload::decode(content_type.as_deref(), &bytes);
        }

        // Prefer the {status, message} error body; fall back to raw text.
        if let Ok(body) = serde_json::from_slice::<serde_json::Value>(&bytes) {
            if let Some(message) = body.get("message").and_then(|m| m.as_str()) {
                let code = body
                    .get("status")
                    .and_then(|s| s.as_u64())
                    .and_then(|s| StatusCode::from_u16(s as u16).ok())
                    .unwrap_or(status);
                return Err(YamfError::from_status(code, message));
            }
        }
        let text = String::from_utf8_lossy(&bytes).into_owned();
        Err(YamfError::from_status(status, text))
    }

    /// Run `op` with the configured retry limit and linear backoff
    /// (`retry_delay_ms × attempt`). Only retryable errors re-run.
    pub async fn with_retry<T, F, Fut>(&self, op: F) -> crate::Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = crate::Result<T>>,
    {
        let attempts = self.config.retry_limit.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    let delay = Duration::from_millis(self.config.retry_delay_ms * attempt as u64);
                    tracing::debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying after transient failure"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
