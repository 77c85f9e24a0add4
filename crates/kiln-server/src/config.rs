//! Configuration for the kiln server.
//!
//! Configuration is loaded from `KILN_*` environment variables on top of the
//! provisioning defaults of [`CoreConfig`].

use kiln_core::{CoreConfig, QueueConfig, RuntimeMode, Workspace};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Configuration for the kiln server.
#[derive(Debug, Clone)]
pub struct KilnConfig {
    /// Provisioning layer settings.
    pub core: CoreConfig,

    /// Admission queue limits.
    pub queue: QueueConfig,

    /// HTTP server bind address.
    pub http_addr: SocketAddr,

    /// JSON file with the workspace templates to serve.
    pub workspaces_file: Option<PathBuf>,

    /// How often finished jobs past their retention are swept.
    pub job_cleanup_interval: Duration,
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("kernel file not found: {0}")]
    MissingKernel(PathBuf),

    #[error("base rootfs not found: {0}")]
    MissingRootfs(PathBuf),

    #[error("firecracker binary not found: {0}")]
    MissingFirecracker(PathBuf),

    #[error("failed to read workspaces from {path}: {message}")]
    Workspaces { path: PathBuf, message: String },

    #[error(transparent)]
    Core(#[from] kiln_core::CoreError),
}

impl Default for KilnConfig {
    fn default() -> Self {
        Self {
            core: CoreConfig::default(),
            queue: QueueConfig::default(),
            http_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), 4000),
            workspaces_file: None,
            job_cleanup_interval: Duration::from_secs(300),
        }
    }
}

impl KilnConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `KILN_MODE` | `production` (production, synthetic) |
    /// | `KILN_HTTP_HOST` | `0.0.0.0` |
    /// | `KILN_HTTP_PORT` | `4000` |
    /// | `KILN_BRIDGE` | `br0` |
    /// | `KILN_GUEST_SUBNET` | `172.16.0` |
    /// | `KILN_FIRST_OCTET` | `10` |
    /// | `KILN_LAST_OCTET` | `254` |
    /// | `KILN_VOLUME_GROUP` | `sandbox-vg` |
    /// | `KILN_THIN_POOL` | `thin-pool` |
    /// | `KILN_DEFAULT_IMAGE` | `dev-base` |
    /// | `KILN_OVERLAY_DIR` | `/var/lib/sandbox/overlays` |
    /// | `KILN_BASE_ROOTFS` | `/var/lib/sandbox/firecracker/rootfs/rootfs.ext4` |
    /// | `KILN_PROXY_ADMIN` | `http://localhost:2019` |
    /// | `KILN_DOMAIN_SUFFIX` | `sandbox.localhost` |
    /// | `KILN_KERNEL` | `/var/lib/sandbox/firecracker/kernels/vmlinux` |
    /// | `KILN_FIRECRACKER` | `/usr/local/bin/firecracker` |
    /// | `KILN_SOCKET_DIR` | `/var/lib/sandbox/sockets` |
    /// | `KILN_LOG_DIR` | `/var/log/sandbox` |
    /// | `KILN_AGENT_TIMEOUT_SECS` | `60` |
    /// | `KILN_MAX_CONCURRENT` | `2` |
    /// | `KILN_JOB_RETENTION_SECS` | `3600` |
    /// | `KILN_WORKSPACES` | unset |
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let path = |key: &str| lookup(key).map(PathBuf::from);
        let secs = |key: &str| parse_as::<u64>(&lookup, key).map(Duration::from_secs);

        let mut config = Self::default();
        let core = &mut config.core;

        if let Some(mode) = lookup("KILN_MODE") {
            core.mode = RuntimeMode::parse(&mode);
        }

        set(&mut core.network.bridge_name, lookup("KILN_BRIDGE"));
        set(&mut core.network.guest_subnet, lookup("KILN_GUEST_SUBNET"));
        set(&mut core.network.first_octet, parse_as(&lookup, "KILN_FIRST_OCTET"));
        set(&mut core.network.last_octet, parse_as(&lookup, "KILN_LAST_OCTET"));

        set(&mut core.storage.volume_group, lookup("KILN_VOLUME_GROUP"));
        set(&mut core.storage.thin_pool, lookup("KILN_THIN_POOL"));
        set(&mut core.storage.default_image, lookup("KILN_DEFAULT_IMAGE"));
        set(&mut core.storage.overlay_dir, path("KILN_OVERLAY_DIR"));
        set(&mut core.storage.base_rootfs, path("KILN_BASE_ROOTFS"));

        set(&mut core.proxy.admin_url, lookup("KILN_PROXY_ADMIN"));
        set(&mut core.proxy.domain_suffix, lookup("KILN_DOMAIN_SUFFIX"));

        set(&mut core.paths.kernel_path, path("KILN_KERNEL"));
        set(&mut core.paths.firecracker_path, path("KILN_FIRECRACKER"));
        set(&mut core.paths.socket_dir, path("KILN_SOCKET_DIR"));
        set(&mut core.paths.log_dir, path("KILN_LOG_DIR"));

        set(&mut core.timing.agent_wait.timeout, secs("KILN_AGENT_TIMEOUT_SECS"));

        set(&mut config.queue.max_concurrent, parse_as(&lookup, "KILN_MAX_CONCURRENT"));
        set(&mut config.queue.retention, secs("KILN_JOB_RETENTION_SECS"));

        let http_host: IpAddr = parse_as(&lookup, "KILN_HTTP_HOST").unwrap_or(config.http_addr.ip());
        let http_port: u16 = parse_as(&lookup, "KILN_HTTP_PORT").unwrap_or(config.http_addr.port());
        config.http_addr = SocketAddr::new(http_host, http_port);
        config.workspaces_file = path("KILN_WORKSPACES");

        config
    }

    /// Validate the configuration, including host paths used in production.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.core.validate()?;
        if self.core.mode == RuntimeMode::Synthetic {
            return Ok(());
        }

        let paths = &self.core.paths;
        if !paths.kernel_path.exists() {
            return Err(ConfigError::MissingKernel(paths.kernel_path.clone()));
        }
        if !paths.firecracker_path.exists() {
            return Err(ConfigError::MissingFirecracker(paths.firecracker_path.clone()));
        }
        if !self.core.storage.base_rootfs.exists() {
            return Err(ConfigError::MissingRootfs(self.core.storage.base_rootfs.clone()));
        }
        Ok(())
    }

    /// Validate configuration but only log warnings instead of failing.
    ///
    /// Use this for development hosts where images are not installed yet.
    pub fn validate_warn(&self) {
        if let Err(e) = self.core.validate() {
            tracing::warn!(error = %e, "Invalid provisioning configuration");
        }
        if self.core.mode == RuntimeMode::Synthetic {
            tracing::info!("Synthetic mode, skipping host path checks");
            return;
        }

        let paths = &self.core.paths;
        if !paths.kernel_path.exists() {
            tracing::warn!("Kernel not found: {:?}", paths.kernel_path);
        }
        if !paths.firecracker_path.exists() {
            tracing::warn!("Firecracker not found: {:?}", paths.firecracker_path);
        }
        if !self.core.storage.base_rootfs.exists() {
            tracing::warn!("Base rootfs not found: {:?}", self.core.storage.base_rootfs);
        }
    }

    /// Read the workspace templates named by `KILN_WORKSPACES`.
    ///
    /// No file configured means no workspaces.
    pub fn load_workspaces(&self) -> Result<Vec<Workspace>, ConfigError> {
        match &self.workspaces_file {
            Some(path) => read_workspaces(path),
            None => Ok(Vec::new()),
        }
    }
}

fn read_workspaces(path: &Path) -> Result<Vec<Workspace>, ConfigError> {
    let error = |message: String| ConfigError::Workspaces {
        path: path.to_path_buf(),
        message,
    };
    let raw = std::fs::read_to_string(path).map_err(|e| error(e.to_string()))?;
    serde_json::from_str(&raw).map_err(|e| error(e.to_string()))
}

fn parse_as<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|v| v.parse().ok())
}

fn set<T>(target: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *target = value;
    }
}
