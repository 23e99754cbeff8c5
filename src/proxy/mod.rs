//! The concurrent routing plane.
//!
//! Per-service balancer workers own selector state and serve next-backend
//! decisions over channels; health watchers long-poll the registry and feed
//! the workers; the mount table dispatches requests; the registry sync
//! supervisor creates and destroys the worker pairs as membership changes.

pub mod balancer;
pub mod health_check;
pub mod router;
pub mod sync;
pub mod worker;

use std::sync::Arc;

use self::balancer::BackendUrl;
use self::router::MountEntry;

/// Per-request proxy context.
#[derive(Default)]
pub struct ProxyContext {
    /// Mount entry resolved for this request, when one matched.
    pub entry: Option<Arc<MountEntry>>,
    /// Backend chosen by the service's balancer worker.
    pub backend: Option<BackendUrl>,
}
