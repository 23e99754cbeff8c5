//! Consul-backed registry adapter.
//!
//! Speaks the Consul HTTP API directly: a recursive KV listing for service
//! discovery and blocking `/v1/health/service` queries for membership, with
//! `X-Consul-Index` as the monotonic change counter driving long-polls.

use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use serde::Deserialize;

use super::{Endpoint, Registry, Service, ServiceSnapshot};
use crate::error::{ConductorError, ConductorResult};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const LIST_TIMEOUT: Duration = Duration::from_secs(10);

/// Registry adapter over the Consul HTTP API.
pub struct ConsulRegistry {
    client: reqwest::Client,
    base_url: String,
    datacenter: String,
    kv_prefix: String,
}

impl ConsulRegistry {
    pub fn new(host: &str, datacenter: &str, kv_prefix: &str) -> ConductorResult<Self> {
        let base_url = if host.starts_with("http://") || host.starts_with("https://") {
            host.trim_end_matches('/').to_string()
        } else {
            format!("http://{host}")
        };

        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| ConductorError::Config(format!("building consul client: {e}")))?;

        Ok(Self {
            client,
            base_url,
            datacenter: datacenter.to_string(),
            kv_prefix: kv_prefix.trim_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Registry for ConsulRegistry {
    async fn list_services(&self) -> ConductorResult<Vec<Service>> {
        let url = format!("{}/v1/kv/{}", self.base_url, self.kv_prefix);
        let response = self
            .client
            .get(&url)
            .query(&[("recurse", "true"), ("dc", self.datacenter.as_str())])
            .timeout(LIST_TIMEOUT)
            .send()
            .await
            .map_err(|e| ConductorError::registry("listing services", e))?;

        // Consul answers 404 when nothing exists under the prefix.
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }

        let response = response
            .error_for_status()
            .map_err(|e| ConductorError::registry("listing services", e))?;

        let pairs: Vec<KvPair> = response
            .json()
            .await
            .map_err(|e| ConductorError::registry("decoding service list", e))?;

        Ok(pairs
            .iter()
            .filter_map(|kv| kv_to_service(kv, &self.kv_prefix))
            .collect())
    }

    async fn watch_healthy(
        &self,
        service_name: &str,
        last_index: u64,
        wait: Duration,
    ) -> ConductorResult<ServiceSnapshot> {
        let url = format!("{}/v1/health/service/{}", self.base_url, service_name);
        let index = last_index.to_string();
        let wait_param = format!("{}s", wait.as_secs());

        let response = self
            .client
            .get(&url)
            .query(&[
                ("dc", self.datacenter.as_str()),
                ("passing", "1"),
                ("consistent", "1"),
                ("index", index.as_str()),
                ("wait", wait_param.as_str()),
            ])
            // Consul adds up to wait/16 of jitter before answering.
            .timeout(wait + wait / 16 + CONNECT_TIMEOUT)
            .send()
            .await
            .map_err(|e| ConductorError::registry("health query", e))?
            .error_for_status()
            .map_err(|e| ConductorError::registry("health query", e))?;

        let new_index = consul_index(response.headers())?;

        let entries: Vec<HealthEntry> = response
            .json()
            .await
            .map_err(|e| ConductorError::registry("decoding health entries", e))?;

        Ok(ServiceSnapshot {
            name: service_name.to_string(),
            last_index: new_index,
            endpoints: entries_to_endpoints(&entries),
        })
    }
}

fn consul_index(headers: &http::HeaderMap) -> ConductorResult<u64> {
    headers
        .get("X-Consul-Index")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .ok_or_else(|| {
            ConductorError::Registry("health response missing X-Consul-Index".to_string())
        })
}

/// KV pair as returned by `/v1/kv/...?recurse`. `Value` is base64 on the
/// wire; the decoded bytes are themselves the base64 encoding of the mount
/// point the operator stored.
#[derive(Debug, Deserialize)]
struct KvPair {
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "Value")]
    value: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HealthEntry {
    #[serde(rename = "Node")]
    node: HealthNode,
    #[serde(rename = "Service")]
    service: HealthService,
}

#[derive(Debug, Deserialize)]
struct HealthNode {
    #[serde(rename = "Node")]
    name: String,
    #[serde(rename = "Address")]
    address: String,
}

#[derive(Debug, Deserialize)]
struct HealthService {
    #[serde(rename = "Port")]
    port: u16,
}

/// Strips the KV prefix from a key to recover the service name.
fn service_name_from_key<'a>(key: &'a str, kv_prefix: &str) -> &'a str {
    key.strip_prefix(kv_prefix)
        .map(|rest| rest.trim_start_matches('/'))
        .unwrap_or(key)
}

/// Recovers the mount point from the stored KV value.
///
/// Falls back to `/<service_name>` when the value is missing, not valid
/// base64, or not UTF-8. Trailing slashes are trimmed so `/solr/` and
/// `/solr` mount identically.
fn mount_point_from_value(value: Option<&[u8]>, service_name: &str) -> String {
    let decoded = value
        .and_then(|v| general_purpose::STANDARD.decode(v).ok())
        .and_then(|bytes| String::from_utf8(bytes).ok());

    let mount = match decoded {
        Some(mount) if !mount.is_empty() => mount,
        _ => format!("/{service_name}"),
    };

    let trimmed = mount.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

fn kv_to_service(kv: &KvPair, kv_prefix: &str) -> Option<Service> {
    let name = service_name_from_key(&kv.key, kv_prefix);
    // A recurse listing includes the folder key itself; skip it.
    if name.is_empty() {
        return None;
    }

    let value_bytes = kv
        .value
        .as_ref()
        .and_then(|v| general_purpose::STANDARD.decode(v).ok());
    let mount_point = mount_point_from_value(value_bytes.as_deref(), name);

    Some(Service::new(name, &mount_point))
}

fn entries_to_endpoints(entries: &[HealthEntry]) -> Vec<Endpoint> {
    entries
        .iter()
        .filter(|e| !e.node.address.is_empty() && e.service.port > 0)
        .map(|e| Endpoint::new(&e.node.name, &e.node.address, e.service.port))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport_encode(stored: &str) -> String {
        general_purpose::STANDARD.encode(stored)
    }

    #[test]
    fn test_service_name_from_key() {
        assert_eq!(
            service_name_from_key("conductor/services/solr", "conductor/services"),
            "solr"
        );
        assert_eq!(service_name_from_key("unrelated/key", "conductor/services"), "unrelated/key");
        assert_eq!(service_name_from_key("conductor/services/", "conductor/services"), "");
    }

    #[test]
    fn test_mount_point_round_trip() {
        // base64("/x/y") comes back as the mount /x/y
        let stored = general_purpose::STANDARD.encode("/x/y");
        assert_eq!(mount_point_from_value(Some(stored.as_bytes()), "svc"), "/x/y");

        // the documented example: "L3NvbHI=" is /solr
        assert_eq!(mount_point_from_value(Some(b"L3NvbHI="), "solr"), "/solr");
    }

    #[test]
    fn test_mount_point_invalid_base64_falls_back() {
        assert_eq!(mount_point_from_value(Some(b"!!INVALID!!"), "solr"), "/solr");
        assert_eq!(mount_point_from_value(None, "backend_v1"), "/backend_v1");
    }

    #[test]
    fn test_mount_point_trailing_slash_trimmed() {
        let stored = general_purpose::STANDARD.encode("/solr/");
        assert_eq!(mount_point_from_value(Some(stored.as_bytes()), "solr"), "/solr");

        let stored = general_purpose::STANDARD.encode("/");
        assert_eq!(mount_point_from_value(Some(stored.as_bytes()), "solr"), "/");
    }

    #[test]
    fn test_kv_to_service() {
        let kv = KvPair {
            key: "conductor/services/solr".to_string(),
            // on the wire the stored base64 is base64-encoded once more
            value: Some(transport_encode("L3NvbHI=")),
        };
        let service = kv_to_service(&kv, "conductor/services").unwrap();
        assert_eq!(service.name, "solr");
        assert_eq!(service.mount_point, "/solr");
        assert!(service.endpoints.is_empty());
    }

    #[test]
    fn test_kv_to_service_skips_folder_key() {
        let kv = KvPair {
            key: "conductor/services/".to_string(),
            value: None,
        };
        assert!(kv_to_service(&kv, "conductor/services").is_none());
    }

    #[test]
    fn test_kv_to_service_invalid_value_mounts_under_name() {
        let kv = KvPair {
            key: "conductor/services/backend_service_v1".to_string(),
            value: Some(transport_encode("!!INVALID!!")),
        };
        let service = kv_to_service(&kv, "conductor/services").unwrap();
        assert_eq!(service.name, "backend_service_v1");
        assert_eq!(service.mount_point, "/backend_service_v1");
    }

    #[test]
    fn test_entries_to_endpoints() {
        let raw = r#"[
            {"Node": {"Node": "solr1", "Address": "solr1.example.com"},
             "Service": {"Port": 8983}},
            {"Node": {"Node": "solr2", "Address": "solr2.example.com"},
             "Service": {"Port": 8984}},
            {"Node": {"Node": "ghost", "Address": ""},
             "Service": {"Port": 8985}}
        ]"#;
        let entries: Vec<HealthEntry> = serde_json::from_str(raw).unwrap();
        let endpoints = entries_to_endpoints(&entries);
        assert_eq!(
            endpoints,
            vec![
                Endpoint::new("solr1", "solr1.example.com", 8983),
                Endpoint::new("solr2", "solr2.example.com", 8984),
            ]
        );
    }
}
