//! Route registration on the reverse proxy's admin API.
//!
//! Caddy evaluates routes in array order and a `*.{suffix}` catch-all must
//! come last. Every mutation is a single reconcile of the full route array:
//! read it, drop the routes being replaced or removed together with every
//! wildcard, append the new routes, append one wildcard if any existed, and
//! write the array back in one request. There is no window in which the
//! fallback route is missing.

use crate::config::{ProxyConfig, ServicePorts};
use crate::error::{CoreError, Result};
use crate::sandbox::{SandboxId, SandboxUrls};
use async_trait::async_trait;
use hyper::client::HttpConnector;
use hyper::{Body, Client, Method, Request, StatusCode};
use serde_json::{json, Value};
use std::collections::HashSet;
use tokio::sync::Mutex;

/// `@id` of the catch-all route.
pub const WILDCARD_ROUTE_ID: &str = "wildcard-fallback";

/// Public URLs of the standard guest services.
pub fn service_urls(id: &SandboxId, ip: &str, suffix: &str) -> SandboxUrls {
    SandboxUrls {
        vscode: format!("https://sandbox-{id}.{suffix}"),
        opencode: format!("https://opencode-{id}.{suffix}"),
        terminal: format!("https://terminal-{id}.{suffix}"),
        ssh: format!("ssh root@{ip}"),
    }
}

/// Adds and removes the proxy routes of a sandbox.
#[async_trait]
pub trait RouteRegistrar: Send + Sync {
    /// URLs the sandbox's routes are reachable at, without touching the proxy.
    fn urls(&self, id: &SandboxId, ip: &str) -> SandboxUrls;

    /// Route every guest service of `id` to `ip`. Re-registering replaces.
    async fn register_routes(
        &self,
        id: &SandboxId,
        ip: &str,
        ports: &ServicePorts,
    ) -> Result<SandboxUrls>;

    /// Remove every route of `id`. Succeeds when none exist.
    async fn remove_routes(&self, id: &SandboxId) -> Result<()>;

    /// Install the catch-all route for unknown subdomains if none exists.
    async fn ensure_wildcard(&self) -> Result<()> {
        Ok(())
    }
}

/// Named and default URL of a dev-server route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevRouteUrls {
    pub named_url: String,
    pub default_url: Option<String>,
}

fn route_id(route: &Value) -> Option<&str> {
    route.get("@id").and_then(Value::as_str)
}

fn is_wildcard(route: &Value) -> bool {
    route
        .pointer("/match/0/host")
        .and_then(Value::as_array)
        .is_some_and(|hosts| {
            hosts
                .iter()
                .filter_map(Value::as_str)
                .any(|h| h.starts_with("*."))
        })
}

/// Exact-host route with streaming-friendly proxy settings.
fn service_route(domain: &str, upstream: &str) -> Value {
    json!({
        "@id": domain,
        "match": [{ "host": [domain] }],
        "handle": [{
            "handler": "reverse_proxy",
            "upstreams": [{ "dial": upstream }],
            "transport": { "protocol": "http", "read_buffer_size": 4096 },
            "flush_interval": -1
        }],
        "terminal": true
    })
}

fn wildcard_route(suffix: &str) -> Value {
    json!({
        "@id": WILDCARD_ROUTE_ID,
        "match": [{ "host": [format!("*.{suffix}")] }],
        "handle": [{
            "handler": "subroute",
            "routes": [{
                "handle": [{
                    "handler": "static_response",
                    "body": "Sandbox not found or not running",
                    "status_code": 502
                }]
            }]
        }],
        "terminal": true
    })
}

/// [`RouteRegistrar`] backed by the Caddy admin API.
pub struct CaddyRegistrar {
    client: Client<HttpConnector>,
    config: ProxyConfig,
    /// Serialises read-modify-write cycles on the route array.
    lock: Mutex<()>,
}

impl CaddyRegistrar {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            client: Client::new(),
            config,
            lock: Mutex::new(()),
        }
    }

    fn routes_uri(&self) -> String {
        format!(
            "{}/config/apps/http/servers/{}/routes",
            self.config.admin_url.trim_end_matches('/'),
            self.config.server_name
        )
    }

    fn domain(&self, label: &str) -> String {
        format!("{label}.{}", self.config.domain_suffix)
    }

    /// Whether the admin API answers.
    pub async fn is_healthy(&self) -> bool {
        let uri = format!("{}/config/", self.config.admin_url.trim_end_matches('/'));
        match uri.parse::<hyper::Uri>() {
            Ok(uri) => matches!(self.client.get(uri).await, Ok(resp) if resp.status().is_success()),
            Err(_) => false,
        }
    }

    /// Current route array, in evaluation order.
    pub async fn list_routes(&self) -> Result<Vec<Value>> {
        Ok(self.fetch_routes().await?.unwrap_or_default())
    }

    /// Route `dev-{name}-{id}` (and `dev-{id}` when `is_default`) to `ip:port`.
    pub async fn register_dev_route(
        &self,
        id: &SandboxId,
        ip: &str,
        name: &str,
        port: u16,
        is_default: bool,
    ) -> Result<DevRouteUrls> {
        let upstream = format!("{ip}:{port}");
        let named = self.domain(&format!("dev-{name}-{id}"));
        let mut routes = vec![service_route(&named, &upstream)];
        let default = is_default.then(|| self.domain(&format!("dev-{id}")));
        if let Some(domain) = &default {
            routes.push(service_route(domain, &upstream));
        }

        self.reconcile(|_| false, routes).await?;
        tracing::info!(sandbox_id = %id, name, port, is_default, "Dev route registered");
        Ok(DevRouteUrls {
            named_url: format!("https://{named}"),
            default_url: default.map(|d| format!("https://{d}")),
        })
    }

    pub async fn remove_dev_route(&self, id: &SandboxId, name: &str, is_default: bool) -> Result<()> {
        let named = self.domain(&format!("dev-{name}-{id}"));
        let default = self.domain(&format!("dev-{id}"));
        self.reconcile(
            |route| {
                route_id(route).is_some_and(|rid| rid == named || (is_default && rid == default))
            },
            Vec::new(),
        )
        .await?;
        tracing::info!(sandbox_id = %id, name, "Dev route removed");
        Ok(())
    }

    /// Apply one mutation to the route array.
    ///
    /// Routes matching `remove`, routes whose id is re-added, and every
    /// wildcard are dropped; `add` is appended, then a single wildcard if the
    /// array held one. Nothing is written when nothing changes.
    async fn reconcile<F>(&self, remove: F, add: Vec<Value>) -> Result<bool>
    where
        F: Fn(&Value) -> bool + Send,
    {
        let _guard = self.lock.lock().await;
        let current = self.fetch_routes().await?;
        let exists = current.is_some();

        let add_ids: HashSet<&str> = add.iter().filter_map(route_id).collect();
        let mut changed = !add.is_empty();
        let mut wildcard = None;
        let mut kept = Vec::new();

        for route in current.unwrap_or_default() {
            if is_wildcard(&route) {
                if wildcard.is_some() {
                    changed = true;
                } else {
                    wildcard = Some(route);
                }
                continue;
            }
            if remove(&route) {
                changed = true;
                continue;
            }
            if route_id(&route).is_some_and(|id| add_ids.contains(id)) {
                continue;
            }
            kept.push(route);
        }

        if !changed {
            return Ok(false);
        }

        kept.extend(add);
        kept.extend(wildcard);
        self.write_routes(&kept, exists).await?;
        Ok(true)
    }

    /// `None` when the server has no route array yet.
    async fn fetch_routes(&self) -> Result<Option<Vec<Value>>> {
        let uri = self.routes_uri();
        let request = Request::builder()
            .method(Method::GET)
            .uri(&uri)
            .body(Body::empty())
            .map_err(|e| CoreError::ProxyRegistration(format!("failed to build request: {e}")))?;
        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| CoreError::ProxyRegistration(format!("GET {uri} failed: {e}")))?;

        let status = response.status();
        let body = hyper::body::to_bytes(response.into_body())
            .await
            .unwrap_or_default();
        if matches!(status, StatusCode::NOT_FOUND | StatusCode::BAD_REQUEST) {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(CoreError::ProxyRegistration(format!(
                "GET {uri} returned {status}: {}",
                String::from_utf8_lossy(&body)
            )));
        }

        match serde_json::from_slice::<Value>(&body)? {
            Value::Array(routes) => Ok(Some(routes)),
            Value::Null => Ok(None),
            other => Err(CoreError::ProxyRegistration(format!(
                "unexpected route list: {other}"
            ))),
        }
    }

    /// Replace the route array (`PATCH`), or create it (`PUT`) when absent.
    async fn write_routes(&self, routes: &[Value], exists: bool) -> Result<()> {
        let uri = self.routes_uri();
        let method = if exists { Method::PATCH } else { Method::PUT };
        let body = serde_json::to_vec(routes)?;
        tracing::trace!(%method, routes = routes.len(), "Writing proxy routes");

        let request = Request::builder()
            .method(method.clone())
            .uri(&uri)
            .header("Content-Type", "application/json")
            .body(Body::from(body))
            .map_err(|e| CoreError::ProxyRegistration(format!("failed to build request: {e}")))?;
        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| CoreError::ProxyRegistration(format!("{method} {uri} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = hyper::body::to_bytes(response.into_body())
                .await
                .unwrap_or_default();
            let body = String::from_utf8_lossy(&body).into_owned();
            tracing::error!(%method, status = %status, body = %body, "Proxy rejected route update");
            return Err(CoreError::ProxyRegistration(format!(
                "{method} {uri} returned {status}: {body}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl RouteRegistrar for CaddyRegistrar {
    fn urls(&self, id: &SandboxId, ip: &str) -> SandboxUrls {
        service_urls(id, ip, &self.config.domain_suffix)
    }

    async fn register_routes(
        &self,
        id: &SandboxId,
        ip: &str,
        ports: &ServicePorts,
    ) -> Result<SandboxUrls> {
        let start = std::time::Instant::now();
        let routes = vec![
            service_route(&self.domain(&format!("sandbox-{id}")), &format!("{ip}:{}", ports.vscode)),
            service_route(&self.domain(&format!("opencode-{id}")), &format!("{ip}:{}", ports.opencode)),
            service_route(&self.domain(&format!("terminal-{id}")), &format!("{ip}:{}", ports.terminal)),
        ];
        self.reconcile(|_| false, routes).await?;

        tracing::info!(
            sandbox_id = %id,
            ip,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Proxy routes registered"
        );
        Ok(self.urls(id, ip))
    }

    async fn remove_routes(&self, id: &SandboxId) -> Result<()> {
        let suffix = format!("-{id}.{}", self.config.domain_suffix);
        let removed = self
            .reconcile(
                |route| route_id(route).is_some_and(|rid| rid.ends_with(&suffix)),
                Vec::new(),
            )
            .await?;
        tracing::info!(sandbox_id = %id, removed, "Proxy routes removed");
        Ok(())
    }

    async fn ensure_wildcard(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        let current = self.fetch_routes().await?;
        if current.as_ref().is_some_and(|r| r.iter().any(is_wildcard)) {
            return Ok(());
        }
        let exists = current.is_some();
        let mut routes = current.unwrap_or_default();
        routes.push(wildcard_route(&self.config.domain_suffix));
        self.write_routes(&routes, exists).await?;
        tracing::info!(suffix = %self.config.domain_suffix, "Wildcard fallback route installed");
        Ok(())
    }
}

/// Registrar for hosts without a proxy: reports URLs, routes nothing.
#[derive(Debug, Clone)]
pub struct OfflineRegistrar {
    domain_suffix: String,
}

impl OfflineRegistrar {
    pub fn new(domain_suffix: impl Into<String>) -> Self {
        Self {
            domain_suffix: domain_suffix.into(),
        }
    }
}

#[async_trait]
impl RouteRegistrar for OfflineRegistrar {
    fn urls(&self, id: &SandboxId, ip: &str) -> SandboxUrls {
        service_urls(id, ip, &self.domain_suffix)
    }

    async fn register_routes(
        &self,
        id: &SandboxId,
        ip: &str,
        _ports: &ServicePorts,
    ) -> Result<SandboxUrls> {
        tracing::debug!(sandbox_id = %id, "Offline proxy, routes not registered");
        Ok(self.urls(id, ip))
    }

    async fn remove_routes(&self, id: &SandboxId) -> Result<()> {
        tracing::debug!(sandbox_id = %id, "Offline proxy, nothing to remove");
        Ok(())
    }
}
