//! The registry's authoritative in-memory state.
//!
//! Plain data and pure transitions, no I/O: the command layer in
//! `registry::mod` snapshots or mutates this struct under a single lock and
//! never holds it across an await. Resets on process restart — there is no
//! persistence.
//!
//! Invariants maintained at every observation point:
//! - for every service S and location l in `services[S]`, `addresses[l] == S`
//! - removing the last location of S removes S from `services` entirely
//! - port allocation per home is monotonic for the registry's lifetime

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::balance::{Balancer, Strategy};
use crate::wire::unix_timestamp_ms;

/// First port handed out for a home that has never allocated one.
pub const DEFAULT_START_PORT: u16 = 10000;

/// Exact-match route table entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteTarget {
    pub service: String,
    #[serde(rename = "dataType", default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,
}

/// Longest-prefix-match route table entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerTarget {
    pub service: String,
}

/// Per-service registration metadata.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceMetadata {
    /// Never receives cache-update pushes; synchronizes by pull only.
    pub pull_only: bool,
    /// Reachable from outside the fabric.
    pub public: bool,
    /// Registered its own location instead of using port allocation.
    pub preregistered: bool,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub service_type: Option<String>,
    /// Unix millis at registration.
    pub registered_at: u64,
}

/// The `{services, addresses}` snapshot returned to a registering service,
/// which seeds its local directory cache.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DirectorySnapshot {
    pub services: BTreeMap<String, Vec<String>>,
    pub addresses: BTreeMap<String, String>,
    #[serde(default)]
    pub subscriptions: BTreeMap<String, Vec<String>>,
}

/// Full state serialization for `registry-pull`: sets become arrays, maps
/// become objects.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Snapshot {
    pub services: BTreeMap<String, Vec<String>>,
    pub addresses: BTreeMap<String, String>,
    pub routes: BTreeMap<String, RouteTarget>,
    pub controller_routes: BTreeMap<String, ControllerTarget>,
    pub subscriptions: BTreeMap<String, Vec<String>>,
    pub service_auth: BTreeMap<String, String>,
    pub service_metadata: BTreeMap<String, ServiceMetadata>,
}

impl Snapshot {
    /// Resolve a request path to a service: exact table first, then the
    /// longest matching controller prefix. This is the lookup the gateway
    /// runs against its pulled view.
    pub fn resolve_route(&self, path: &str) -> Option<&str> {
        if let Some(target) = self.routes.get(path) {
            return Some(&target.service);
        }
        self.controller_routes
            .iter()
            .filter(|(prefix, _)| path.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, target)| target.service.as_str())
    }

    pub fn route_count(&self) -> usize {
        self.routes.len() + self.controller_routes.len()
    }
}

/// Authoritative directory of services, routes, subscriptions, ports, and
/// auth mappings.
#[derive(Debug)]
pub struct RegistryState {
    start_port: u16,
    services: BTreeMap<String, BTreeSet<String>>,
    addresses: BTreeMap<String, String>,
    routes: BTreeMap<String, RouteTarget>,
    controller_routes: BTreeMap<String, ControllerTarget>,
    domain_ports: BTreeMap<String, u16>,
    subscriptions: BTreeMap<String, BTreeSet<String>>,
    service_auth: BTreeMap<String, String>,
    service_metadata: BTreeMap<String, ServiceMetadata>,
    balancer: Balancer,
}

impl RegistryState {
    pub fn new(start_port: u16) -> Self {
        RegistryState {
            start_port,
            services: BTreeMap::new(),
            addresses: BTreeMap::new(),
            routes: BTreeMap::new(),
            controller_routes: BTreeMap::new(),
            domain_ports: BTreeMap::new(),
            subscriptions: BTreeMap::new(),
            service_auth: BTreeMap::new(),
            service_metadata: BTreeMap::new(),
            balancer: Balancer::new(),
        }
    }

    /// Allocate the next port for a home. Monotonic per home; an allocation
    /// that is never followed by a registration stays consumed until the
    /// registry restarts.
    pub fn allocate_port(&mut self, home: &str) -> u16 {
        let next = *self.domain_ports.get(home).unwrap_or(&self.start_port);
        self.domain_ports.insert(home.to_string(), next.wrapping_add(1));
        next
    }

    /// Insert a service location, updating the reverse map, the auth
    /// mapping, and metadata. Re-registering an existing pair is a no-op
    /// for `services`/`addresses` but refreshes auth and metadata.
    pub fn register(
        &mut self,
        name: &str,
        location: &str,
        auth_service: Option<String>,
        mut metadata: ServiceMetadata,
    ) {
        self.services
            .entry(name.to_string())
            .or_default()
            .insert(location.to_string());
        self.addresses.insert(location.to_string(), name.to_string());
        if let Some(auth) = auth_service {
            self.service_auth.insert(name.to_string(), auth);
        }
        if metadata.registered_at == 0 {
            metadata.registered_at = unix_timestamp_ms();
        }
        self.service_metadata.insert(name.to_string(), metadata);
    }

    /// Remove a service location. Dropping the last location removes the
    /// service entirely, together with its auth mapping, metadata, and
    /// round-robin counter. Every subscription held by the location is
    /// dropped too.
    pub fn unregister(&mut self, name: &str, location: &str) {
        if let Some(locations) = self.services.get_mut(name) {
            locations.remove(location);
            if locations.is_empty() {
                self.services.remove(name);
                self.service_auth.remove(name);
                self.service_metadata.remove(name);
                self.balancer.forget(name);
            }
        }
        self.addresses.remove(location);
        self.remove_subscriber_everywhere(location);
    }

    fn remove_subscriber_everywhere(&mut self, location: &str) {
        let mut empty_channels = Vec::new();
        for (channel, subscribers) in self.subscriptions.iter_mut() {
            subscribers.remove(location);
            if subscribers.is_empty() {
                empty_channels.push(channel.clone());
            }
        }
        for channel in empty_channels {
            self.subscriptions.remove(&channel);
        }
    }

    pub fn locations(&self, name: &str) -> Vec<String> {
        self.services
            .get(name)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Pick one location for a service with the given strategy.
    pub fn select(&mut self, name: &str, strategy: Strategy) -> crate::Result<String> {
        let locations = self.locations(name);
        self.balancer
            .select(name, &locations, strategy)
            .map(str::to_string)
    }

    pub fn service_of(&self, location: &str) -> Option<&str> {
        self.addresses.get(location).map(String::as_str)
    }

    pub fn auth_service_of(&self, name: &str) -> Option<String> {
        self.service_auth.get(name).cloned()
    }

    pub fn metadata_of(&self, name: &str) -> Option<&ServiceMetadata> {
        self.service_metadata.get(name)
    }

    /// Register a route. Paths with a trailing wildcard (or an explicit
    /// `controller` route type) land in the prefix table, normalized to end
    /// in `/`; everything else is an exact match.
    pub fn register_route(
        &mut self,
        path: &str,
        service: &str,
        data_type: Option<String>,
        route_type: Option<&str>,
    ) {
        let wildcard = path.ends_with("/*") || path.ends_with('*');
        let controller = wildcard || route_type == Some("controller");
        if controller {
            let mut prefix = path.trim_end_matches('*').to_string();
            if !prefix.ends_with('/') {
                prefix.push('/');
            }
            self.controller_routes
                .insert(prefix, ControllerTarget { service: service.to_string() });
        } else {
            self.routes.insert(
                path.to_string(),
                RouteTarget { service: service.to_string(), data_type },
            );
        }
    }

    pub fn subscribe(&mut self, channel: &str, location: &str) {
        self.subscriptions
            .entry(channel.to_string())
            .or_default()
            .insert(location.to_string());
    }

    /// Remove one subscriber; an emptied channel disappears.
    pub fn unsubscribe(&mut self, channel: &str, location: &str) {
        if let Some(subscribers) = self.subscriptions.get_mut(channel) {
            subscribers.remove(location);
            if subscribers.is_empty() {
                self.subscriptions.remove(channel);
            }
        }
    }

    pub fn subscribers(&self, channel: &str) -> Vec<String> {
        self.subscriptions
            .get(channel)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// All registered locations that receive cache-update pushes: everyone
    /// except the triggering location and pull-only services.
    pub fn broadcast_targets(&self, exclude: &str) -> Vec<String> {
        self.addresses
            .iter()
            .filter(|(location, _)| location.as_str() != exclude)
            .filter(|(_, service)| {
                !self
                    .service_metadata
                    .get(*service)
                    .map(|m| m.pull_only)
                    .unwrap_or(false)
            })
            .map(|(location, _)| location.clone())
            .collect()
    }

    pub fn services_map(&self) -> BTreeMap<String, Vec<String>> {
        self.services
            .iter()
            .map(|(name, set)| (name.clone(), set.iter().cloned().collect()))
            .collect()
    }

    fn subscriptions_map(&self) -> BTreeMap<String, Vec<String>> {
        self.subscriptions
            .iter()
            .map(|(channel, set)| (channel.clone(), set.iter().cloned().collect()))
            .collect()
    }

    /// The `{services, addresses}` view handed to a registering service.
    pub fn directory_snapshot(&self) -> DirectorySnapshot {
        DirectorySnapshot {
            services: self.services_map(),
            addresses: self.addresses.clone(),
            subscriptions: self.subscriptions_map(),
        }
    }

    /// Full state for `registry-pull`.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            services: self.services_map(),
            addresses: self.addresses.clone(),
            routes: self.routes.clone(),
            controller_routes: self.controller_routes.clone(),
            subscriptions: self.subscriptions_map(),
            service_auth: self.service_auth.clone(),
            service_metadata: self.service_metadata.clone(),
        }
    }

    #[cfg(test)]
    pub fn assert_invariants(&self) {
        for (name, locations) in &self.services {
            assert!(
                !locations.is_empty(),
                "service '{name}' kept with no locations"
            );
            for location in locations {
                assert_eq!(
                    self.addresses.get(location).map(String::as_str),
                    Some(name.as_str()),
                    "addresses inconsistent for {location}"
                );
            }
        }
        for (location, name) in &self.addresses {
            assert!(
                self.services
                    .get(name)
                    .map(|set| set.contains(location))
                    .unwrap_or(false),
                "address {location} -> {name} with no matching service entry"
            );
        }
    }
}

impl Default for RegistryState {
    fn default() -> Self {
        RegistryState::new(DEFAULT_START_PORT)
    }
}
