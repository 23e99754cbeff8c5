//! Load-balancing policies.
//!
//! A policy is a constructor from a service snapshot to a stateful selector
//! closure; the closure is called once per inbound request, owns its own
//! cursor state, and never blocks. Policies are looked up by name at startup.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use rand::Rng;

use crate::registry::Service;

/// Target URL for one proxied request: scheme `http`, host `address:port`.
///
/// The empty host is the "no healthy backends" sentinel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendUrl {
    pub host: String,
}

impl BackendUrl {
    pub fn new(address: &str, port: u16) -> Self {
        Self {
            host: format!("{address}:{port}"),
        }
    }

    pub fn unavailable() -> Self {
        Self::default()
    }

    pub fn is_unavailable(&self) -> bool {
        self.host.is_empty()
    }
}

/// Stateful next-backend chooser, built per service snapshot.
pub type Selector = Box<dyn FnMut() -> BackendUrl + Send>;

/// Policy constructor: captures the service and owns the cursor state.
pub type PolicyBuilder = fn(Service) -> Selector;

static POLICIES: Lazy<HashMap<&'static str, PolicyBuilder>> = Lazy::new(|| {
    let mut policies: HashMap<&'static str, PolicyBuilder> = HashMap::new();
    policies.insert("naive_round_robin", naive_round_robin);
    policies.insert("random", random);
    policies
});

/// Looks up a policy constructor by its CLI name.
pub fn policy_builder(name: &str) -> Option<PolicyBuilder> {
    POLICIES.get(name).copied()
}

/// Round-robin over the snapshot's endpoints, first call returning the first
/// endpoint.
pub fn naive_round_robin(service: Service) -> Selector {
    let mut cursor = 0usize;
    Box::new(move || {
        if service.endpoints.is_empty() {
            return BackendUrl::unavailable();
        }
        let endpoint = &service.endpoints[cursor];
        cursor = (cursor + 1) % service.endpoints.len();
        BackendUrl::new(&endpoint.address, endpoint.port)
    })
}

/// Uniform random choice over the snapshot's endpoints.
pub fn random(service: Service) -> Selector {
    Box::new(move || {
        if service.endpoints.is_empty() {
            return BackendUrl::unavailable();
        }
        let index = rand::thread_rng().gen_range(0..service.endpoints.len());
        let endpoint = &service.endpoints[index];
        BackendUrl::new(&endpoint.address, endpoint.port)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
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

    #[test]
    fn test_naive_round_robin_rotation() {
        let mut next = naive_round_robin(solr());

        let url = next();
        assert_eq!(url.host, "solr1.example.com:8983");

        let url = next();
        assert_eq!(url.host, "solr2.example.com:8984");

        // wraps back to the first endpoint
        let url = next();
        assert_eq!(url.host, "solr1.example.com:8983");
    }

    #[test]
    fn test_naive_round_robin_empty_endpoints() {
        let mut next = naive_round_robin(Service::new("solr", "/solr"));
        assert!(next().is_unavailable());
        assert!(next().is_unavailable());
    }

    #[test]
    fn test_random_selects_a_member() {
        let service = solr();
        let hosts: Vec<String> = service
            .endpoints
            .iter()
            .map(|e| format!("{}:{}", e.address, e.port))
            .collect();
        let mut next = random(service);
        for _ in 0..16 {
            assert!(hosts.contains(&next().host));
        }
    }

    #[test]
    fn test_random_empty_endpoints() {
        let mut next = random(Service::new("solr", "/solr"));
        assert!(next().is_unavailable());
    }

    #[test]
    fn test_policy_builder_lookup() {
        assert!(policy_builder("naive_round_robin").is_some());
        assert!(policy_builder("random").is_some());
        assert!(policy_builder("least_connections").is_none());
    }

    #[test]
    fn test_rebuilt_selector_restarts_at_first_endpoint() {
        let mut next = naive_round_robin(solr());
        let _ = next();

        // a fresh selector over a new snapshot starts from endpoint 0 again
        let mut next = naive_round_robin(solr());
        assert_eq!(next().host, "solr1.example.com:8983");
    }
}
