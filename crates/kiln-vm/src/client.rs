//! Firecracker control-socket client.
//!
//! Every call is a blocking HTTP/1.1 request over the per-VM Unix socket.
//! Configuration must happen before `InstanceStart`.

use crate::config::{DriveConfig, NetworkInterfaceConfig};
use crate::error::{Result, VmError};
use firepilot_models::models::MachineConfiguration;
use hyper::client::Client;
use hyper::{Body, Method, Request};
use hyperlocal::{UnixClientExt, UnixConnector, Uri};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Total time to wait for the control socket to accept connections.
pub const SOCKET_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between socket and state polls.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Serialize)]
struct BootSource<'a> {
    kernel_image_path: &'a str,
    boot_args: &'a str,
}

#[derive(Debug, Serialize)]
struct Drive<'a> {
    drive_id: &'a str,
    path_on_host: &'a str,
    is_root_device: bool,
    is_read_only: bool,
}

#[derive(Debug, Serialize)]
struct NetworkInterface<'a> {
    iface_id: &'a str,
    guest_mac: &'a str,
    host_dev_name: &'a str,
}

#[derive(Debug, Serialize)]
struct InstanceAction {
    action_type: &'static str,
}

/// Subset of `GET /` we care about.
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceInfo {
    /// "Not started", "Running" or "Paused"
    pub state: String,
    #[serde(default)]
    pub id: Option<String>,
}

/// Client for one Firecracker API socket.
#[derive(Clone)]
pub struct FirecrackerClient {
    socket_path: PathBuf,
    client: Client<UnixConnector>,
}

impl FirecrackerClient {
    /// Create a client for the socket at `socket_path`. No connection is made.
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            client: Client::unix(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Wait until the control socket answers `GET /`.
    ///
    /// # Errors
    /// Returns [`VmError::Timeout`] if the socket never becomes usable.
    pub async fn wait_for_socket(&self, timeout: Duration) -> Result<()> {
        let start = tokio::time::Instant::now();
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            if self.socket_path.exists() {
                match self.instance_info().await {
                    Ok(_) => {
                        tracing::debug!(
                            socket = %self.socket_path.display(),
                            elapsed_ms = start.elapsed().as_millis() as u64,
                            attempts,
                            "Control socket ready"
                        );
                        return Ok(());
                    }
                    Err(e) => tracing::trace!(error = %e, attempt = attempts, "Socket not ready, retrying..."),
                }
            }
            if start.elapsed() >= timeout {
                tracing::warn!(socket = %self.socket_path.display(), attempts, "Control socket timeout");
                return Err(VmError::Timeout(timeout));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// `PUT /boot-source`
    pub async fn set_boot_source(&self, kernel_path: &Path, boot_args: &str) -> Result<()> {
        let kernel = kernel_path.to_string_lossy();
        let body = BootSource {
            kernel_image_path: &kernel,
            boot_args,
        };
        self.put("/boot-source", &body).await
    }

    /// `PUT /drives/{drive_id}`
    pub async fn set_drive(&self, drive: &DriveConfig) -> Result<()> {
        let path_on_host = drive.path_on_host.to_string_lossy();
        let body = Drive {
            drive_id: &drive.drive_id,
            path_on_host: &path_on_host,
            is_root_device: drive.is_root_device,
            is_read_only: drive.is_read_only,
        };
        self.put(&format!("/drives/{}", drive.drive_id), &body).await
    }

    /// `PUT /network-interfaces/{iface_id}`
    pub async fn set_network_interface(&self, iface: &NetworkInterfaceConfig) -> Result<()> {
        let body = NetworkInterface {
            iface_id: &iface.iface_id,
            guest_mac: &iface.guest_mac,
            host_dev_name: &iface.host_dev_name,
        };
        self.put(&format!("/network-interfaces/{}", iface.iface_id), &body)
            .await
    }

    /// `PUT /machine-config`
    pub async fn set_machine_config(&self, vcpu_count: u8, mem_size_mib: u32) -> Result<()> {
        let config = MachineConfiguration::new(mem_size_mib as i32, vcpu_count as i32);
        self.put("/machine-config", &config).await
    }

    /// `PUT /cpu-config` with the contents of a CPU template file.
    ///
    /// Returns `false` when the template is missing or rejected; older
    /// Firecracker builds lack the endpoint and the VM boots fine without it.
    pub async fn set_cpu_config(&self, template_path: &Path) -> bool {
        let raw = match tokio::fs::read_to_string(template_path).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::debug!(path = %template_path.display(), error = %e, "CPU template unavailable");
                return false;
            }
        };
        let template: serde_json::Value = match serde_json::from_str(&raw) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(path = %template_path.display(), error = %e, "CPU template is not valid JSON");
                return false;
            }
        };
        match self.put("/cpu-config", &template).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "CPU template rejected, continuing without it");
                false
            }
        }
    }

    /// `PUT /actions {"action_type": "InstanceStart"}`
    pub async fn start(&self) -> Result<()> {
        let action = InstanceAction {
            action_type: "InstanceStart",
        };
        self.put("/actions", &action).await
    }

    /// `GET /`
    pub async fn instance_info(&self) -> Result<InstanceInfo> {
        let uri: hyper::Uri = Uri::new(&self.socket_path, "/").into();
        let request = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .header("Accept", "application/json")
            .body(Body::empty())
            .map_err(|e| VmError::Config(format!("failed to build request: {e}")))?;

        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| VmError::Transport(format!("GET / failed: {e}")))?;

        let status = response.status();
        let body = hyper::body::to_bytes(response.into_body())
            .await
            .map_err(|e| VmError::Transport(format!("failed to read body: {e}")))?;
        if !status.is_success() {
            return Err(VmError::Api {
                method: "GET".into(),
                path: "/".into(),
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        Ok(serde_json::from_slice(&body)?)
    }

    /// Whether the instance reports the `Running` state.
    pub async fn is_running(&self) -> bool {
        matches!(self.instance_info().await, Ok(info) if info.state == "Running")
    }

    /// Poll the instance state until it reports `Running`.
    ///
    /// # Errors
    /// Returns [`VmError::Timeout`] once `timeout` elapses.
    pub async fn wait_for_running(&self, timeout: Duration) -> Result<()> {
        let start = tokio::time::Instant::now();
        while start.elapsed() < timeout {
            if self.is_running().await {
                tracing::debug!(
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Instance running"
                );
                return Ok(());
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        Err(VmError::Timeout(timeout))
    }

    async fn put<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> Result<()> {
        let start = std::time::Instant::now();
        let body = serde_json::to_string(body)?;
        tracing::trace!(path, body = %body, "Firecracker request body");

        let uri: hyper::Uri = Uri::new(&self.socket_path, path).into();
        let request = Request::builder()
            .method(Method::PUT)
            .uri(uri)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .body(Body::from(body))
            .map_err(|e| VmError::Config(format!("failed to build PUT {path} request: {e}")))?;

        let response = self.client.request(request).await.map_err(|e| {
            tracing::error!(path, error = %e, "Firecracker request failed");
            VmError::Transport(format!("PUT {path} failed: {e}"))
        })?;

        let status = response.status();
        if !status.is_success() {
            let body_bytes = hyper::body::to_bytes(response.into_body())
                .await
                .unwrap_or_default();
            let body_str = String::from_utf8_lossy(&body_bytes).into_owned();
            tracing::error!(path, status = %status, body = %body_str, "Firecracker rejected request");
            return Err(VmError::Api {
                method: "PUT".into(),
                path: path.into(),
                status: status.as_u16(),
                body: body_str,
            });
        }

        tracing::debug!(
            path,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Firecracker request succeeded"
        );
        Ok(())
    }
}
