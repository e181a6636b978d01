//! The per-service call context handed to application handlers.
//!
//! Carries the outbound side of a service: RPC calls to other services
//! (local cache first, registry fallback) and event publishing through the
//! registry's fan-out.

use std::sync::Arc;

use crate::balance;
use crate::error::YamfError;
use crate::wire::{Command, Payload, header};

use super::ServiceInner;

/// Explicit handler context — every outbound capability of a service.
#[derive(Clone)]
pub struct Context {
    pub(crate) inner: Arc<ServiceInner>,
}

impl Context {
    /// The name of the service executing the current handler.
    pub fn service_name(&self) -> &str {
        &self.inner.name
    }

    /// This service instance's own location.
    pub fn location(&self) -> &str {
        &self.inner.location
    }

    /// Call another service by name.
    ///
    /// A cache hit goes straight to a randomly selected location; a miss
    /// (or a stale cache entry that no longer answers) goes through the
    /// registry, which owns lookup and load balancing. Failures carry the
    /// caller's name so cross-service errors read end to end.
    pub async fn call(
        &self,
        target: &str,
        payload: impl Into<Payload>,
    ) -> crate::Result<Payload> {
        let payload = payload.into();
        let cached = self.inner.cache.locations(target).await;

        if let Ok(location) = balance::pick_random(target, &cached) {
            match self.direct_call(target, location, &payload).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() => {
                    tracing::debug!(
                        target = %target,
                        location = %location,
                        error = %e,
                        "cached location unreachable, falling back to registry"
                    );
                }
                Err(e) => return Err(self.name_the_caller(target, e)),
            }
        }

        self.inner
            .client
            .registry_command(
                Command::ServiceCall,
                &[(header::SERVICE_NAME, target)],
                &payload,
            )
            .await
            .map_err(|e| self.name_the_caller(target, e))
    }

    async fn direct_call(
        &self,
        target: &str,
        location: &str,
        payload: &Payload,
    ) -> crate::Result<Payload> {
        self.inner
            .client
            .command(
                location,
                Command::ServiceCall,
                &[(header::SERVICE_NAME, target)],
                payload,
            )
            .await
    }

    /// Publish a message to a channel. The registry fans out to every
    /// subscriber and answers with the `{results, errors}` aggregate.
    pub async fn publish(
        &self,
        channel: &str,
        message: impl Into<Payload>,
    ) -> crate::Result<Payload> {
        let message = message.into();
        self.inner
            .client
            .registry_command(
                Command::PubsubPublish,
                &[(header::PUBSUB_CHANNEL, channel)],
                &message,
            )
            .await
    }

    fn name_the_caller(&self, target: &str, error: YamfError) -> YamfError {
        match error {
            YamfError::NotFound(message) => YamfError::NotFound(format!(
                "{message} (called from '{}')",
                self.inner.name
            )),
            other => other,
        }
    }
}
