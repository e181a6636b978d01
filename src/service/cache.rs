//! Per-service directory cache.
//!
//! A derived, eventually consistent copy of the registry's directory:
//! seeded from the `service-register` response and kept fresh by
//! `cache-update` broadcasts. Updates are idempotent — broadcasts can
//! arrive in any order and duplicates are harmless.

use serde::Deserialize;
use tokio::sync::RwLock;

use crate::registry::state::DirectorySnapshot;

/// Incremental cache-update message broadcast by the registry.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheUpdate {
    pub action: String,
    pub service: String,
    pub location: String,
}

/// The service-local copy of the fabric directory.
#[derive(Debug, Default)]
pub struct DirectoryCache {
    inner: RwLock<DirectorySnapshot>,
}

impl DirectoryCache {
    pub fn new() -> Self {
        DirectoryCache::default()
    }

    /// Replace the whole cache with a registration-time snapshot.
    pub async fn seed(&self, snapshot: DirectorySnapshot) {
        *self.inner.write().await = snapshot;
    }

    /// Apply one incremental update. Unknown actions are ignored with a
    /// log line — the cache must tolerate newer registries.
    pub async fn apply(&self, update: &CacheUpdate) {
        let mut inner = self.inner.write().await;
        match update.action.as_str() {
            "register" => {
                let locations = inner.services.entry(update.service.clone()).or_default();
                if !locations.contains(&update.location) {
                    locations.push(update.location.clone());
                }
                inner
                    .addresses
                    .insert(update.location.clone(), update.service.clone());
            }
            "unregister" => {
                if let Some(locations) = inner.services.get_mut(&update.service) {
                    locations.retain(|l| l != &update.location);
                    if locations.is_empty() {
                        inner.services.remove(&update.service);
                    }
                }
                inner.addresses.remove(&update.location);
                inner.subscriptions.retain(|_, subscribers| {
                    subscribers.retain(|l| l != &update.location);
                    !subscribers.is_empty()
                });
            }
            other => {
                tracing::debug!(action = %other, "ignoring unknown cache-update action");
            }
        }
    }

    pub async fn locations(&self, service: &str) -> Vec<String> {
        self.inner
            .read()
            .await
            .services
            .get(service)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn service_of(&self, location: &str) -> Option<String> {
        self.inner.read().await.addresses.get(location).cloned()
    }

    /// A full copy, for inspection and tests.
    pub async fn snapshot(&self) -> DirectorySnapshot {
        self.inner.read().await.clone()
    }
}
