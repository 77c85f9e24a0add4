//! Host and provisioning configuration.
//!
//! Every section has defaults matching a standard host layout, so a test or a
//! development box only overrides what differs.

use crate::error::CoreError;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

/// Guest networking on the host bridge.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Bridge every TAP device is enslaved to.
    pub bridge_name: String,
    /// Bridge address, used as the guest gateway.
    pub bridge_ip: Ipv4Addr,
    /// First three octets of the guest /24, e.g. `172.16.0`.
    pub guest_subnet: String,
    /// Lowest host octet handed to guests.
    pub first_octet: u8,
    /// Highest host octet handed to guests.
    pub last_octet: u8,
    pub dns_servers: Vec<Ipv4Addr>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bridge_name: "br0".into(),
            bridge_ip: Ipv4Addr::new(172, 16, 0, 1),
            guest_subnet: "172.16.0".into(),
            first_octet: 10,
            last_octet: 254,
            dns_servers: vec![Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(8, 8, 4, 4)],
        }
    }
}

/// LVM thin pool and overlay fallback.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub volume_group: String,
    pub thin_pool: String,
    /// Volume snapshotted when no image or prebuild volume exists.
    pub base_volume: String,
    pub image_prefix: String,
    pub prebuild_prefix: String,
    pub sandbox_prefix: String,
    /// Base image used when neither request nor workspace names one.
    pub default_image: String,
    /// Full-copy overlays live here when the pool is missing.
    pub overlay_dir: PathBuf,
    /// Source of full-copy overlays.
    pub base_rootfs: PathBuf,
    pub lvcreate: PathBuf,
    pub lvremove: PathBuf,
    pub lvs: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            volume_group: "sandbox-vg".into(),
            thin_pool: "thin-pool".into(),
            base_volume: "base-rootfs".into(),
            image_prefix: "image-".into(),
            prebuild_prefix: "prebuild-".into(),
            sandbox_prefix: "sandbox-".into(),
            default_image: "dev-base".into(),
            overlay_dir: PathBuf::from("/var/lib/sandbox/overlays"),
            base_rootfs: PathBuf::from("/var/lib/sandbox/firecracker/rootfs/rootfs.ext4"),
            lvcreate: PathBuf::from("/usr/sbin/lvcreate"),
            lvremove: PathBuf::from("/usr/sbin/lvremove"),
            lvs: PathBuf::from("/usr/sbin/lvs"),
        }
    }
}

/// Reverse proxy admin endpoint.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Base URL of the admin API, e.g. `http://localhost:2019`.
    pub admin_url: String,
    /// HTTP server whose route list is managed.
    pub server_name: String,
    /// Domain every sandbox subdomain hangs off.
    pub domain_suffix: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            admin_url: "http://localhost:2019".into(),
            server_name: "srv0".into(),
            domain_suffix: "sandbox.localhost".into(),
        }
    }
}

/// Host locations used by the hypervisor layer.
#[derive(Debug, Clone)]
pub struct PathsConfig {
    pub socket_dir: PathBuf,
    pub log_dir: PathBuf,
    pub kernel_path: PathBuf,
    pub firecracker_path: PathBuf,
    /// Applied only when the file exists.
    pub cpu_template: Option<PathBuf>,
    /// Scratch directory for loopback mounts during config injection.
    pub mount_root: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            socket_dir: PathBuf::from("/var/lib/sandbox/sockets"),
            log_dir: PathBuf::from("/var/log/sandbox"),
            kernel_path: PathBuf::from("/var/lib/sandbox/firecracker/kernels/vmlinux"),
            firecracker_path: PathBuf::from("/usr/local/bin/firecracker"),
            cpu_template: Some(PathBuf::from("/var/lib/sandbox/cpu-template-no-avx.json")),
            mount_root: PathBuf::from("/tmp"),
        }
    }
}

/// Guest service ports exposed through the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicePorts {
    pub vscode: u16,
    pub opencode: u16,
    pub terminal: u16,
    pub agent: u16,
}

impl Default for ServicePorts {
    fn default() -> Self {
        Self {
            vscode: 8080,
            opencode: 3000,
            terminal: 7681,
            agent: 9999,
        }
    }
}

/// Sizing used when neither request nor workspace specifies it.
#[derive(Debug, Clone, Copy)]
pub struct SandboxDefaults {
    pub vcpus: u8,
    pub memory_mb: u32,
}

impl Default for SandboxDefaults {
    fn default() -> Self {
        Self {
            vcpus: 2,
            memory_mb: 2048,
        }
    }
}

/// Polling parameters for the agent readiness gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentWait {
    pub timeout: Duration,
    pub interval: Duration,
}

impl Default for AgentWait {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            interval: Duration::from_secs(2),
        }
    }
}

/// Deadlines and grace periods of the provisioning saga.
#[derive(Debug, Clone, Copy)]
pub struct TimingConfig {
    pub agent_wait: AgentWait,
    /// Firecracker must survive this long after spawn.
    pub startup_grace: Duration,
    /// Deadline for the instance to report `Running`.
    pub boot_timeout: Duration,
    /// SIGTERM to SIGKILL delay during rollback.
    pub rollback_kill_grace: Duration,
    /// SIGTERM to SIGKILL delay during destroy.
    pub destroy_kill_grace: Duration,
    pub clone_timeout: Duration,
    pub init_command_timeout: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            agent_wait: AgentWait::default(),
            startup_grace: kiln_vm::STARTUP_GRACE,
            boot_timeout: Duration::from_secs(30),
            rollback_kill_grace: Duration::from_millis(100),
            destroy_kill_grace: Duration::from_millis(500),
            clone_timeout: Duration::from_secs(120),
            init_command_timeout: Duration::from_secs(300),
        }
    }
}

/// Whether sagas touch real virtualization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RuntimeMode {
    #[default]
    Production,
    /// Stop after the record is created and report it running.
    Synthetic,
}

impl RuntimeMode {
    /// Parse from string (case-insensitive).
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "synthetic" | "mock" | "dry-run" => Self::Synthetic,
            _ => Self::Production,
        }
    }
}

/// Everything the provisioning layer needs to know about the host.
#[derive(Debug, Clone, Default)]
pub struct CoreConfig {
    pub network: NetworkConfig,
    pub storage: StorageConfig,
    pub proxy: ProxyConfig,
    pub paths: PathsConfig,
    pub ports: ServicePorts,
    pub defaults: SandboxDefaults,
    pub timing: TimingConfig,
    pub mode: RuntimeMode,
}

impl CoreConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), CoreError> {
        let net = &self.network;
        if net.first_octet < 2 || net.first_octet > net.last_octet || net.last_octet == 255 {
            return Err(CoreError::Config(format!(
                "guest octet range {}-{} must lie within 2-254",
                net.first_octet, net.last_octet
            )));
        }
        if net.guest_subnet.split('.').count() != 3
            || net.guest_subnet.split('.').any(|p| p.parse::<u8>().is_err())
        {
            return Err(CoreError::Config(format!(
                "guest_subnet must have three octets, got {}",
                net.guest_subnet
            )));
        }
        if self.defaults.vcpus == 0 {
            return Err(CoreError::Config("default vcpus must be > 0".into()));
        }
        if self.defaults.memory_mb < 128 {
            return Err(CoreError::Config("default memory must be >= 128 MiB".into()));
        }
        if self.timing.agent_wait.interval.is_zero() {
            return Err(CoreError::Config("agent poll interval must be > 0".into()));
        }
        if self.proxy.domain_suffix.is_empty() {
            return Err(CoreError::Config("domain_suffix is required".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = CoreConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.network.first_octet, 10);
        assert_eq!(config.storage.volume_group, "sandbox-vg");
        assert_eq!(config.ports.agent, 9999);
        assert_eq!(config.timing.agent_wait.timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_validate_octet_range() {
        let mut config = CoreConfig::default();
        config.network.first_octet = 20;
        config.network.last_octet = 10;
        assert!(config.validate().is_err());

        config.network.first_octet = 10;
        config.network.last_octet = 255;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_subnet() {
        let mut config = CoreConfig::default();
        config.network.guest_subnet = "172.16".into();
        assert!(config.validate().is_err());

        config.network.guest_subnet = "10.0.300".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_runtime_mode_parsing() {
        assert_eq!(RuntimeMode::parse("synthetic"), RuntimeMode::Synthetic);
        assert_eq!(RuntimeMode::parse("MOCK"), RuntimeMode::Synthetic);
        assert_eq!(RuntimeMode::parse("production"), RuntimeMode::Production);
        assert_eq!(RuntimeMode::parse("anything"), RuntimeMode::Production);
    }
}
