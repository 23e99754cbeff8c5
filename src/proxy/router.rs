//! Dynamic mount-point router.
//!
//! The stock HTTP routers are write-once; this proxy registers and
//! deregisters mounts while requests are in flight. The authoritative set
//! lives in a concurrent map and every mutation publishes a fresh
//! longest-first snapshot behind an atomic pointer swap, so the request hot
//! path is a lock-free, allocation-free scan that never observes a torn
//! table.

use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use tokio::sync::mpsc;

use super::worker::ReplySender;
use crate::error::{ConductorError, ConductorResult};

/// One installed mount: the service it belongs to and the request channel of
/// that service's balancer worker.
pub struct MountEntry {
    pub service_name: String,
    pub mount_point: String,
    pub request_tx: mpsc::Sender<ReplySender>,
}

/// Path-prefix route table with runtime register/deregister.
#[derive(Default)]
pub struct MountTable {
    entries: DashMap<String, Arc<MountEntry>>,
    matcher: ArcSwap<Vec<Arc<MountEntry>>>,
}

impl MountTable {
    /// Installs a mount. Fails if the mount point is already present; two
    /// live services never share one.
    pub fn register(&self, entry: MountEntry) -> ConductorResult<()> {
        use dashmap::mapref::entry::Entry;

        match self.entries.entry(entry.mount_point.clone()) {
            Entry::Occupied(_) => {
                return Err(ConductorError::AlreadyRegistered(entry.mount_point))
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(entry));
            }
        }
        self.rebuild();
        Ok(())
    }

    /// Removes a mount. Requests that would have matched it fall through to
    /// the catch-all once this returns.
    pub fn deregister(&self, mount_point: &str) {
        if self.entries.remove(mount_point).is_some() {
            self.rebuild();
        }
    }

    /// Finds the entry with the longest mount point that the path equals or
    /// continues at a `/` boundary.
    pub fn lookup(&self, path: &str) -> Option<Arc<MountEntry>> {
        let snapshot = self.matcher.load();
        snapshot
            .iter()
            .find(|entry| prefix_matches(path, &entry.mount_point))
            .cloned()
    }

    /// Registered mounts sorted by service name, for the endpoints listing.
    pub fn snapshot(&self) -> Vec<Arc<MountEntry>> {
        let mut entries: Vec<_> = self.entries.iter().map(|e| e.value().clone()).collect();
        entries.sort_by(|a, b| a.service_name.cmp(&b.service_name));
        entries
    }

    // The supervisor is the only writer, so rebuilds never race each other.
    fn rebuild(&self) {
        let mut entries: Vec<_> = self.entries.iter().map(|e| e.value().clone()).collect();
        entries.sort_by(|a, b| {
            b.mount_point
                .len()
                .cmp(&a.mount_point.len())
                .then_with(|| a.mount_point.cmp(&b.mount_point))
        });
        self.matcher.store(Arc::new(entries));
    }
}

fn prefix_matches(path: &str, mount_point: &str) -> bool {
    match path.strip_prefix(mount_point) {
        Some("") => true,
        Some(rest) => rest.starts_with('/'),
        None => false,
    }
}
