//! Registry reconciliation supervisor.
//!
//! Owns the authoritative service set. On a timer it re-lists services from
//! the registry, starts a balancer worker + health watcher pair and installs
//! a mount for each new service, and tears the pair down for each removed
//! one. Runs as a Pingora background service so shutdown reaches it through
//! the server's watch.

use std::collections::HashSet;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use pingora_core::server::ShutdownWatch;
use pingora_core::services::background::BackgroundService;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use super::balancer::PolicyBuilder;
use super::health_check::HealthWatcher;
use super::router::{MountEntry, MountTable};
use super::worker::BalancerWorker;
use crate::config::{RECONCILE_INTERVAL, WATCH_WAIT_TIME};
use crate::registry::{Registry, Service};

pub struct RegistrySync {
    registry: Arc<dyn Registry>,
    mounts: Arc<MountTable>,
    builder: PolicyBuilder,
    services: DashMap<String, ManagedService>,
    bootstrapped: AtomicBool,
}

/// A live service and the handles that tear it down.
struct ManagedService {
    service: Service,
    stop: watch::Sender<bool>,
    worker: JoinHandle<()>,
    watcher: JoinHandle<()>,
}

impl RegistrySync {
    pub fn new(registry: Arc<dyn Registry>, mounts: Arc<MountTable>, builder: PolicyBuilder) -> Self {
        Self {
            registry,
            mounts,
            builder,
            services: DashMap::new(),
            bootstrapped: AtomicBool::new(false),
        }
    }

    /// One reconciliation pass: list, then diff the live set by name.
    ///
    /// The first fetch is a startup sanity check: an unreachable registry or
    /// an empty service list is fatal. Afterwards failures keep the current
    /// set and wait for the next tick; endpoint churn within existing
    /// services is the health watchers' business, not ours.
    async fn reconcile(&self) {
        let bootstrapped = self.bootstrapped.load(Ordering::Relaxed);
        let desired = match self.registry.list_services().await {
            Ok(desired) => desired,
            Err(e) => {
                if !bootstrapped {
                    log::error!(
                        error = e.to_string().as_str(),
                        action = "list_services";
                        "Could not connect to consul!"
                    );
                    process::exit(1);
                }
                log::error!(
                    error = e.to_string().as_str(),
                    action = "list_services";
                    "Failed to list services, keeping current set"
                );
                return;
            }
        };

        log::debug!(services = desired.len(); "Retrieved services");

        if desired.is_empty() && !bootstrapped {
            log::error!("Found no services to proxy!");
            process::exit(1);
        }
        self.bootstrapped.store(true, Ordering::Relaxed);

        for service in &desired {
            if !self.services.contains_key(&service.name) {
                self.add_service(service.clone());
            }
        }

        let desired_names: HashSet<&str> = desired.iter().map(|s| s.name.as_str()).collect();
        let stale: Vec<String> = self
            .services
            .iter()
            .filter(|entry| !desired_names.contains(entry.key().as_str()))
            .map(|entry| entry.key().clone())
            .collect();
        for name in stale {
            self.remove_service(&name);
        }
    }

    /// Starts the worker pair and installs the mount for a new service.
    fn add_service(&self, service: Service) {
        log::info!(
            service_name = service.name.as_str(),
            mount_point = service.mount_point.as_str();
            "Adding service"
        );

        let (stop_tx, stop_rx) = watch::channel(false);

        let (worker, handle) = BalancerWorker::new(self.builder, stop_rx.clone());
        let worker_task = tokio::spawn(worker.run(service.clone()));

        let watcher = HealthWatcher::new(
            self.registry.clone(),
            service.clone(),
            WATCH_WAIT_TIME,
            handle.update_tx.clone(),
            stop_rx,
        );
        let watcher_task = tokio::spawn(watcher.run());

        let installed = self.mounts.register(MountEntry {
            service_name: service.name.clone(),
            mount_point: service.mount_point.clone(),
            request_tx: handle.request_tx.clone(),
        });
        if let Err(e) = installed {
            // The supervisor is the only route writer and diffs by name, so
            // a collision means two services share a mount point.
            log::error!(
                service_name = service.name.as_str(),
                mount_point = service.mount_point.as_str(),
                error = e.to_string().as_str();
                "Mount point collision, refusing to run"
            );
            process::exit(1);
        }

        self.services.insert(
            service.name.clone(),
            ManagedService {
                service,
                stop: stop_tx,
                worker: worker_task,
                watcher: watcher_task,
            },
        );
    }

    /// Tears a service down: route out of the mux first so no new director
    /// can reach the worker, then the stop signal to both tasks.
    fn remove_service(&self, name: &str) -> Option<ManagedService> {
        let (_, managed) = self.services.remove(name)?;

        log::info!(
            service_name = name,
            mount_point = managed.service.mount_point.as_str();
            "Removing service"
        );

        self.mounts.deregister(&managed.service.mount_point);
        let _ = managed.stop.send(true);
        Some(managed)
    }

    fn stop_all(&self) {
        let names: Vec<String> = self.services.iter().map(|e| e.key().clone()).collect();
        for name in names {
            self.remove_service(&name);
        }
    }
}

#[async_trait]
impl BackgroundService for RegistrySync {
    async fn start_service(&self, mut shutdown: ShutdownWatch) {
        loop {
            self.reconcile().await;

            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        log::info!("Shutdown signal received, stopping workers");
                        self.stop_all();
                        return;
                    }
                }

                _ = sleep(RECONCILE_INTERVAL) => {}
            }
        }
    }
}
