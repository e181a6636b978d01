//! YAMF — a polyglot microservice fabric over plain HTTP.
//! A central registry owns the directory of services, routes, and pub/sub
//! subscriptions; a pull-only gateway fronts public traffic; and a service
//! runtime gives application code registration, RPC, pub/sub, and graceful
//! shutdown. Everything speaks the `yamf-*` header protocol.

pub mod balance;
pub mod client;
pub mod config;
pub mod error;
pub mod forwarded;
pub mod gateway;
pub mod naming;
pub mod proxy;
pub mod registry;
pub mod service;
pub mod wire;

pub use client::FabricClient;
pub use config::{Environment, FabricConfig};
pub use error::{Result, YamfError};
pub use gateway::{Gateway, GatewayHandle};
pub use registry::state::{DirectorySnapshot, ServiceMetadata, Snapshot};
pub use registry::{GATEWAY_SERVICE_NAME, Registry, RegistryHandle};
pub use service::{
    BeforeHook, BeforeOutcome, Context, Outcome, Service, ServiceHandler, ServiceOptions,
    SubscriptionHandler, SubscriptionService, before_hook, handler, subscription_handler,
};
pub use wire::{Command, Payload};
