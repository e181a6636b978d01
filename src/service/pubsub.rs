//! The per-service subscription manager.
//!
//! Holds the channel → handler map for one service. Handlers fire in
//! registration order and are isolated from each other: one handler's
//! error lands in the aggregate's `errors` array without stopping the
//! rest. The manager also tracks first/last transitions per channel so the
//! runtime knows when to (un)subscribe with the registry.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::YamfError;
use crate::wire::Payload;

/// Boxed future returned by a subscription handler.
pub type SubscriptionFuture = Pin<Box<dyn Future<Output = crate::Result<Value>> + Send>>;

/// A type-erased async handler for one channel subscription.
pub type SubscriptionHandler = Arc<dyn Fn(Payload) -> SubscriptionFuture + Send + Sync>;

/// Wrap an async closure as a [`SubscriptionHandler`]. The closure's result
/// is serialized into the dispatch aggregate.
pub fn subscription_handler<F, Fut, T>(f: F) -> SubscriptionHandler
where
    F: Fn(Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = crate::Result<T>> + Send + 'static,
    T: Serialize + 'static,
{
    Arc::new(move |payload| -> SubscriptionFuture {
        let fut = f(payload);
        Box::pin(async move {
            let value = fut.await?;
            serde_json::to_value(value)
                .map_err(|e| YamfError::Internal(format!("unserializable handler result: {e}")))
        })
    })
}

/// One failed handler in a dispatch aggregate.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DispatchError {
    #[serde(rename = "subId")]
    pub sub_id: String,
    pub error: String,
    pub status: u16,
}

/// The `{results, errors}` aggregate for one incoming publish.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct DispatchOutcome {
    pub results: Vec<Value>,
    pub errors: Vec<DispatchError>,
}

impl DispatchOutcome {
    pub fn into_payload(self) -> Payload {
        Payload::Json(serde_json::to_value(&self).unwrap_or_else(|_| {
            serde_json::json!({"results": [], "errors": []})
        }))
    }
}

/// Channel → ordered handler list for one service.
#[derive(Default)]
pub struct SubscriptionManager {
    channels: Mutex<HashMap<String, Vec<(String, SubscriptionHandler)>>>,
    next_id: AtomicU64,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        SubscriptionManager::default()
    }

    /// Add a handler. Returns its subscriber id and whether it is the
    /// first handler for this channel (the caller then subscribes with
    /// the registry).
    pub async fn add(&self, channel: &str, handler: SubscriptionHandler) -> (String, bool) {
        let sub_id = format!("{channel}#{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut channels = self.channels.lock().await;
        let handlers = channels.entry(channel.to_string()).or_default();
        let first = handlers.is_empty();
        handlers.push((sub_id.clone(), handler));
        (sub_id, first)
    }

    /// Remove a handler by subscriber id. Returns whether it was found and
    /// whether the channel is now empty (the caller then unsubscribes).
    pub async fn remove(&self, channel: &str, sub_id: &str) -> (bool, bool) {
        let mut channels = self.channels.lock().await;
        let Some(handlers) = channels.get_mut(channel) else {
            return (false, false);
        };
        let before = handlers.len();
        handlers.retain(|(id, _)| id != sub_id);
        let removed = handlers.len() < before;
        let last = handlers.is_empty();
        if last {
            channels.remove(channel);
        }
        (removed, last)
    }

    /// All channels with at least one handler.
    pub async fn channels(&self) -> Vec<String> {
        self.channels.lock().await.keys().cloned().collect()
    }

    /// Dispatch a published message to every handler of a channel, in
    /// registration order, isolating failures per handler.
    pub async fn dispatch(&self, channel: &str, message: &Payload) -> DispatchOutcome {
        let handlers: Vec<(String, SubscriptionHandler)> = self
            .channels
            .lock()
            .await
            .get(channel)
            .cloned()
            .unwrap_or_default();

        let mut outcome = DispatchOutcome::default();
        for (sub_id, handler) in handlers {
            match handler(message.clone()).await {
                Ok(value) => outcome.results.push(value),
                Err(e) => {
                    tracing::debug!(sub_id = %sub_id, error = %e, "subscription handler failed");
                    outcome.errors.push(DispatchError {
                        sub_id,
                        error: e.to_string(),
                        status: e.status().as_u16(),
                    });
                }
            }
        }
        outcome
    }
}
