//! HTTP front end.
//!
//! Matches requests against the mount table, answers the built-in catch-all
//! routes, and for mounted paths acts as the per-service director: asks the
//! service's balancer worker for a target over a per-call reply channel,
//! rewrites the URL, and hands the forwarding to the proxy engine.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use http::StatusCode;
use once_cell::sync::OnceCell;
use pingora_core::upstreams::peer::HttpPeer;
use pingora_error::{Error, ErrorType::InternalError, OrErr, Result};
use pingora_http::RequestHeader;
use pingora_proxy::{ProxyHttp, Session};
use serde::Serialize;
use tokio::sync::oneshot;

use crate::proxy::router::MountTable;
use crate::proxy::ProxyContext;
use crate::utils::request::{html_escape, strip_mount_prefix, upstream_path_and_query};
use crate::utils::response::{send_json, send_json_error, send_no_content};

static GLOBAL_RESOLVER: OnceCell<Arc<TokioAsyncResolver>> = OnceCell::new();

fn get_global_resolver() -> Arc<TokioAsyncResolver> {
    GLOBAL_RESOLVER
        .get_or_init(|| Arc::new(TokioAsyncResolver::tokio_from_system_conf().unwrap()))
        .clone()
}

/// Proxy service fronting the dynamic mount table.
pub struct HttpService {
    mounts: Arc<MountTable>,
}

impl HttpService {
    pub fn new(mounts: Arc<MountTable>) -> Self {
        Self { mounts }
    }

    async fn send_endpoints(&self, session: &mut Session) -> Result<()> {
        let entries = self.mounts.snapshot();
        let body = EndpointsBody {
            endpoints: entries
                .iter()
                .map(|entry| MountInfo {
                    name: &entry.service_name,
                    mount_point: &entry.mount_point,
                })
                .collect(),
        };
        send_json(session, StatusCode::OK, &body).await
    }
}

#[derive(Serialize)]
struct EndpointsBody<'a> {
    endpoints: Vec<MountInfo<'a>>,
}

#[derive(Serialize)]
struct MountInfo<'a> {
    name: &'a str,
    mount_point: &'a str,
}

#[async_trait]
impl ProxyHttp for HttpService {
    type CTX = ProxyContext;

    fn new_ctx(&self) -> Self::CTX {
        Self::CTX::default()
    }

    /// Resolves the mount before any downstream module runs.
    async fn early_request_filter(&self, session: &mut Session, ctx: &mut Self::CTX) -> Result<()> {
        ctx.entry = self.mounts.lookup(session.req_header().uri.path());
        Ok(())
    }

    /// Serves the catch-alls and obtains a backend for mounted paths.
    async fn request_filter(&self, session: &mut Session, ctx: &mut Self::CTX) -> Result<bool> {
        let path = session.req_header().uri.path().to_string();

        let Some(entry) = ctx.entry.clone() else {
            return match path.as_str() {
                "/_ping" => {
                    send_no_content(session).await?;
                    Ok(true)
                }
                "/_endpoints" => {
                    self.send_endpoints(session).await?;
                    Ok(true)
                }
                _ => {
                    log::warn!(
                        url = path.as_str(),
                        error = "no_matching_mount_point";
                        "No mount point matches"
                    );
                    send_json_error(
                        session,
                        StatusCode::BAD_GATEWAY,
                        "no_matching_mount_point",
                        &format!(
                            "I have no backend servers that handle '{}'",
                            html_escape(&path)
                        ),
                    )
                    .await?;
                    Ok(true)
                }
            };
        };

        // Per-call reply channel into the worker's request channel. A closed
        // channel means the worker is mid-teardown; that is a 503, same as
        // an empty snapshot.
        let (reply_tx, reply_rx) = oneshot::channel();
        let backend = match entry.request_tx.send(reply_tx).await {
            Ok(()) => reply_rx.await.ok(),
            Err(_) => None,
        };

        match backend {
            Some(url) if !url.is_unavailable() => {
                ctx.backend = Some(url);
                Ok(false)
            }
            _ => {
                log::warn!(
                    url = path.as_str(),
                    mount_point = entry.mount_point.as_str(),
                    error = "no_healthy_backends";
                    "No healthy backends"
                );
                send_json_error(
                    session,
                    StatusCode::SERVICE_UNAVAILABLE,
                    "no_healthy_backends",
                    &format!(
                        "There are no healthy backends that handle '{}'",
                        html_escape(&path)
                    ),
                )
                .await?;
                Ok(true)
            }
        }
    }

    async fn upstream_peer(
        &self,
        _session: &mut Session,
        ctx: &mut Self::CTX,
    ) -> Result<Box<HttpPeer>> {
        let backend = ctx
            .backend
            .as_ref()
            .ok_or_else(|| Error::new_str("No backend selected for proxied request"))?;

        let addr = resolve_backend_host(&backend.host).await?;
        let sni = backend
            .host
            .rsplit_once(':')
            .map(|(host, _)| host.to_string())
            .unwrap_or_else(|| backend.host.clone());

        Ok(Box::new(HttpPeer::new(addr, false, sni)))
    }

    /// Rewrites the outgoing request: strip the mount point, keep the query,
    /// leave method, headers and body untouched.
    async fn upstream_request_filter(
        &self,
        _session: &mut Session,
        upstream_request: &mut RequestHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        let Some(entry) = ctx.entry.as_ref() else {
            return Ok(());
        };

        let original = upstream_request.uri.path().to_string();
        let rewritten = strip_mount_prefix(&original, &entry.mount_point);
        let path_and_query = upstream_path_and_query(
            &original,
            upstream_request.uri.query(),
            &entry.mount_point,
        );

        let uri = path_and_query
            .parse::<http::Uri>()
            .or_err_with(InternalError, || "rewriting upstream uri")?;
        upstream_request.set_uri(uri);

        let forward_to = ctx
            .backend
            .as_ref()
            .map(|b| b.host.clone())
            .unwrap_or_default();
        log::info!(
            original_request = original.as_str(),
            rewritten_request = rewritten.as_str(),
            mount_point = entry.mount_point.as_str(),
            forward_to = forward_to.as_str();
            "Proxying request"
        );

        Ok(())
    }

    async fn logging(&self, session: &mut Session, e: Option<&Error>, ctx: &mut Self::CTX) {
        if let Some(err) = e {
            let mount_point = ctx
                .entry
                .as_ref()
                .map(|entry| entry.mount_point.as_str())
                .unwrap_or("");
            log::warn!(
                url = session.req_header().uri.path(),
                mount_point = mount_point,
                error = err.to_string().as_str();
                "Request failed"
            );
        }
    }
}

/// Turns an `address:port` target into a socket address, resolving hostnames
/// asynchronously so the hot path never blocks on DNS.
async fn resolve_backend_host(host: &str) -> Result<SocketAddr> {
    if let Ok(addr) = host.parse::<SocketAddr>() {
        return Ok(addr);
    }

    let (name, port) = host
        .rsplit_once(':')
        .ok_or_else(|| Error::new_str("backend host missing port"))?;
    let port: u16 = port
        .parse()
        .map_err(|_| Error::new_str("backend host has invalid port"))?;

    if let Ok(ip) = name.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    let resolver = get_global_resolver();
    let lookup = resolver
        .lookup_ip(name)
        .await
        .or_err_with(InternalError, || format!("resolving backend host {name}"))?;
    let ip = lookup
        .iter()
        .next()
        .ok_or_else(|| Error::new_str("backend host resolved to no addresses"))?;

    Ok(SocketAddr::new(ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoints_body_shape() {
        let body = EndpointsBody {
            endpoints: vec![
                MountInfo {
                    name: "bv1",
                    mount_point: "/backend/v1",
                },
                MountInfo {
                    name: "solr",
                    mount_point: "/solr",
                },
            ],
        };
        assert_eq!(
            serde_json::to_string(&body).unwrap(),
            r#"{"endpoints":[{"name":"bv1","mount_point":"/backend/v1"},{"name":"solr","mount_point":"/solr"}]}"#
        );
    }

    #[tokio::test]
    async fn test_resolve_backend_host_literal_addresses() {
        let addr = resolve_backend_host("127.0.0.1:8983").await.unwrap();
        assert_eq!(addr, "127.0.0.1:8983".parse().unwrap());

        assert!(resolve_backend_host("no-port-here").await.is_err());
        assert!(resolve_backend_host("host:notaport").await.is_err());
    }
}
