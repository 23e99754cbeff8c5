//! Registry data model and the adapter seam.
//!
//! The registry is the source of truth for which services exist (KV entries
//! under a prefix) and which of their backends are healthy (blocking health
//! queries). Everything above this module talks to the [`Registry`] trait;
//! the Consul implementation lives in [`consul`].

pub mod consul;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::ConductorResult;

pub use consul::ConsulRegistry;

/// A reachable backend instance of a service.
///
/// Endpoints are immutable values; updates replace a service's whole endpoint
/// sequence atomically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub node_name: String,
    pub address: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(node_name: &str, address: &str, port: u16) -> Self {
        Self {
            node_name: node_name.to_string(),
            address: address.to_string(),
            port,
        }
    }
}

/// A service exposed by the proxy: a registry name, the URL path prefix it is
/// mounted under, and the most recent healthy endpoint snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub name: String,
    pub mount_point: String,
    pub endpoints: Vec<Endpoint>,
}

impl Service {
    /// A freshly listed service; endpoints arrive via the health watcher.
    pub fn new(name: &str, mount_point: &str) -> Self {
        Self {
            name: name.to_string(),
            mount_point: mount_point.to_string(),
            endpoints: Vec::new(),
        }
    }
}

/// One observation of a service's healthy membership, tagged with the
/// registry's change index at fetch time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSnapshot {
    pub name: String,
    pub last_index: u64,
    pub endpoints: Vec<Endpoint>,
}

/// Minimum registry surface the proxy consumes.
///
/// Shared by all health watchers and the supervisor; implementations must be
/// safe for concurrent use.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Lists the services registered under the configured KV prefix.
    ///
    /// Returned services carry no endpoints; each service's health watcher
    /// fills them in.
    async fn list_services(&self) -> ConductorResult<Vec<Service>>;

    /// Blocking query for the healthy members of one service.
    ///
    /// Returns when the registry's change index for the service exceeds
    /// `last_index` or after `wait` elapses. A snapshot whose index is not
    /// greater than `last_index` means "no change"; callers must not apply
    /// it. `last_index == 0` returns immediately with current membership.
    async fn watch_healthy(
        &self,
        service_name: &str,
        last_index: u64,
        wait: Duration,
    ) -> ConductorResult<ServiceSnapshot>;
}
