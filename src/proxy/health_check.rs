//! Per-service health watcher.
//!
//! Long-polls the registry for the service's healthy membership and pushes
//! fresh snapshots into the balancer worker, backing off exponentially on
//! registry errors.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::sleep;

use crate::registry::{Registry, Service, ServiceSnapshot};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const BACKOFF_MULTIPLIER: u32 = 2;

/// Exponential delay between failed registry polls; any success resets it.
struct Backoff {
    current: Duration,
}

impl Backoff {
    fn new() -> Self {
        Self {
            current: INITIAL_BACKOFF,
        }
    }

    fn next(&mut self) -> Duration {
        let delay = self.current;
        self.current = (delay * BACKOFF_MULTIPLIER).min(MAX_BACKOFF);
        delay
    }

    fn reset(&mut self) {
        self.current = INITIAL_BACKOFF;
    }
}

pub struct HealthWatcher {
    registry: Arc<dyn Registry>,
    service: Service,
    wait: Duration,
    last_index: u64,
    update_tx: mpsc::Sender<Service>,
    stop: watch::Receiver<bool>,
}

impl HealthWatcher {
    /// Starts from `last_index = 0`, so the first poll returns immediately
    /// with current membership and bootstraps the balancer worker.
    pub fn new(
        registry: Arc<dyn Registry>,
        service: Service,
        wait: Duration,
        update_tx: mpsc::Sender<Service>,
        stop: watch::Receiver<bool>,
    ) -> Self {
        Self {
            registry,
            service,
            wait,
            last_index: 0,
            update_tx,
            stop,
        }
    }

    pub async fn run(mut self) {
        let mut backoff = Backoff::new();
        loop {
            log::debug!(
                service_name = self.service.name.as_str(),
                mount_point = self.service.mount_point.as_str(),
                last_index = self.last_index,
                worker_type = "consul_health";
                "Getting service health from registry"
            );

            let result = tokio::select! {
                biased;

                changed = self.stop.changed() => {
                    if changed.is_err() || *self.stop.borrow() {
                        return;
                    }
                    continue;
                }

                result = self
                    .registry
                    .watch_healthy(&self.service.name, self.last_index, self.wait) => result,
            };

            match result {
                Ok(snapshot) => {
                    backoff.reset();
                    if !self.apply(snapshot).await {
                        return;
                    }
                }
                Err(e) => {
                    let delay = backoff.next();
                    log::error!(
                        service_name = self.service.name.as_str(),
                        mount_point = self.service.mount_point.as_str(),
                        last_index = self.last_index,
                        error = e.to_string().as_str(),
                        worker_type = "consul_health";
                        "Error getting service health from registry"
                    );
                    tokio::select! {
                        biased;
                        changed = self.stop.changed() => {
                            if changed.is_err() || *self.stop.borrow() {
                                return;
                            }
                        }
                        _ = sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Applies one poll result; returns false when the worker is gone.
    ///
    /// The first observation is applied unconditionally. Afterwards only a
    /// strictly newer index is applied — including an empty membership, which
    /// makes "no healthy backends" the visible state. Anything else is a
    /// no-change response and is skipped.
    async fn apply(&mut self, snapshot: ServiceSnapshot) -> bool {
        if self.last_index != 0 && snapshot.last_index <= self.last_index {
            log::debug!(
                service_name = self.service.name.as_str(),
                mount_point = self.service.mount_point.as_str(),
                last_index = self.last_index,
                new_index = snapshot.last_index,
                worker_type = "consul_health";
                "Index has not advanced, skipping update"
            );
            return true;
        }

        log::debug!(
            service_name = self.service.name.as_str(),
            mount_point = self.service.mount_point.as_str(),
            last_index = self.last_index,
            new_index = snapshot.last_index,
            endpoints = snapshot.endpoints.len(),
            worker_type = "consul_health";
            "Sending full service list"
        );

        self.last_index = snapshot.last_index;
        self.service.endpoints = snapshot.endpoints;

        // Blocking send: the worker consumes every snapshot in index order.
        if self.update_tx.send(self.service.clone()).await.is_err() {
            log::debug!(
                service_name = self.service.name.as_str(),
                mount_point = self.service.mount_point.as_str(),
                worker_type = "consul_health";
                "Balancer worker gone, stopping health watcher"
            );
            return false;
        }
        true
    }
}
