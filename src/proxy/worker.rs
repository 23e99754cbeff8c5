//! Per-service balancer worker.
//!
//! The worker is the linearisation point for a service's selector: snapshot
//! updates and next-backend requests are serialised through one task, so the
//! selection hot path needs no locks. Directors talk to it with a per-call
//! reply channel.

use tokio::sync::{mpsc, oneshot, watch};

use super::balancer::{BackendUrl, PolicyBuilder, Selector};
use crate::registry::Service;

/// Bursts of requests queue here without back-pressuring the dispatcher.
const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// Reply channel a director encloses with each next-backend request.
pub type ReplySender = oneshot::Sender<BackendUrl>;

/// Channel handles into a running balancer worker.
#[derive(Clone)]
pub struct WorkerHandle {
    pub update_tx: mpsc::Sender<Service>,
    pub request_tx: mpsc::Sender<ReplySender>,
}

pub struct BalancerWorker {
    builder: PolicyBuilder,
    update_rx: mpsc::Receiver<Service>,
    request_rx: mpsc::Receiver<ReplySender>,
    stop: watch::Receiver<bool>,
}

impl BalancerWorker {
    pub fn new(builder: PolicyBuilder, stop: watch::Receiver<bool>) -> (Self, WorkerHandle) {
        // Capacity 1 keeps the snapshot sender blocked until the worker
        // consumes, preserving per-service ordering.
        let (update_tx, update_rx) = mpsc::channel(1);
        let (request_tx, request_rx) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);

        (
            Self {
                builder,
                update_rx,
                request_rx,
                stop,
            },
            WorkerHandle {
                update_tx,
                request_tx,
            },
        )
    }

    /// Runs until stopped, looping over whichever channel is ready.
    ///
    /// A snapshot consumed before a request is served is visible to that
    /// request; update and request arrivals in the same instant may resolve
    /// in either order, but never against a partially built selector. On
    /// return the request receiver drops, so queued directors observe a
    /// closed reply channel and answer 503.
    pub async fn run(mut self, initial: Service) {
        let service_name = initial.name.clone();
        let mount_point = initial.mount_point.clone();
        log::debug!(
            service_name = service_name.as_str(),
            mount_point = mount_point.as_str(),
            worker_type = "load_balancer";
            "Starting loadbalancer worker"
        );

        let mut next: Selector = (self.builder)(initial);
        loop {
            tokio::select! {
                biased;

                changed = self.stop.changed() => {
                    if changed.is_err() || *self.stop.borrow() {
                        break;
                    }
                }

                update = self.update_rx.recv() => match update {
                    Some(service) => next = (self.builder)(service),
                    None => break,
                },

                request = self.request_rx.recv() => match request {
                    // The director may have given up; a dead reply channel is fine.
                    Some(reply) => {
                        let _ = reply.send(next());
                    }
                    None => break,
                },
            }
        }

        log::debug!(
            service_name = service_name.as_str(),
            mount_point = mount_point.as_str(),
            worker_type = "load_balancer";
            "Loadbalancer worker stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::balancer::naive_round_robin;
    use crate::registry::Endpoint;

    fn solr() -> Service {
        Service {
            name: "solr".to_string(),
            mount_point: "/solr".to_string(),
            endpoints: vec![
                Endpoint::new("solr1", "solr1.example.com", 8983),
                Endpoint::new("solr2", "solr2.example.com", 8984),
            ],
        }
    }

    async fn request(handle: &WorkerHandle) -> BackendUrl {
        let (reply_tx, reply_rx) = oneshot::channel();
        handle.request_tx.send(reply_tx).await.unwrap();
        reply_rx.await.unwrap()
    }

    #[tokio::test]
    async fn test_request_from_worker() {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (worker, handle) = BalancerWorker::new(naive_round_robin, stop_rx);
        let task = tokio::spawn(worker.run(solr()));

        let url = request(&handle).await;
        assert_eq!(url.host, "solr1.example.com:8983");

        let url = request(&handle).await;
        assert_eq!(url.host, "solr2.example.com:8984");

        stop_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_update_replaces_selector() {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (worker, handle) = BalancerWorker::new(naive_round_robin, stop_rx);
        let task = tokio::spawn(worker.run(Service::new("solr", "/solr")));

        // no endpoints yet: the sentinel comes back
        assert!(request(&handle).await.is_unavailable());

        handle.update_tx.send(solr()).await.unwrap();

        // the snapshot consumed before this request is visible to it
        let url = request(&handle).await;
        assert_eq!(url.host, "solr1.example.com:8983");

        stop_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_closes_request_channel() {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (worker, handle) = BalancerWorker::new(naive_round_robin, stop_rx);
        let task = tokio::spawn(worker.run(solr()));

        stop_tx.send(true).unwrap();
        task.await.unwrap();

        let (reply_tx, _reply_rx) = oneshot::channel();
        assert!(handle.request_tx.send(reply_tx).await.is_err());
    }

    #[tokio::test]
    async fn test_dropped_stop_sender_stops_worker() {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (worker, _handle) = BalancerWorker::new(naive_round_robin, stop_rx);
        let task = tokio::spawn(worker.run(solr()));

        drop(stop_tx);
        task.await.unwrap();
    }
}
