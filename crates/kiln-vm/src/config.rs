//! Configuration types for MicroVM instances.

use crate::error::{Result, VmError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

const MAX_VCPUS: u8 = 32;
const MIN_MEMORY_MIB: u32 = 128;

/// Kernel command line handed to every sandbox guest.
pub const DEFAULT_BOOT_ARGS: &str =
    "console=ttyS0 reboot=k panic=1 pci=off init=/etc/sandbox/sandbox-init.sh";

/// Machine description applied over the control socket before boot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineConfig {
    pub vcpu_count: u8,
    pub memory_mib: u32,
    pub kernel_path: PathBuf,
    pub boot_args: String,
    /// Sandbox root volume, usually a thin snapshot block device.
    pub root_drive: DriveConfig,
    /// `eth0`, backed by the sandbox TAP device.
    pub network: Option<NetworkInterfaceConfig>,
    /// CPU template JSON file; skipped when absent on disk
    pub cpu_template: Option<PathBuf>,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            vcpu_count: 2,
            memory_mib: 2048,
            kernel_path: PathBuf::from("/var/lib/sandbox/firecracker/kernels/vmlinux"),
            boot_args: DEFAULT_BOOT_ARGS.into(),
            root_drive: DriveConfig::root("/var/lib/sandbox/firecracker/rootfs/rootfs.ext4"),
            network: None,
            cpu_template: None,
        }
    }
}

impl MachineConfig {
    /// Check the values Firecracker would otherwise reject mid-configuration.
    ///
    /// # Errors
    /// Returns [`VmError::Config`] naming the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_VCPUS).contains(&self.vcpu_count) {
            return Err(VmError::Config(format!(
                "vcpu_count must be 1-{MAX_VCPUS}, got {}",
                self.vcpu_count
            )));
        }
        if self.memory_mib < MIN_MEMORY_MIB {
            return Err(VmError::Config(format!(
                "memory_mib must be at least {MIN_MEMORY_MIB}, got {}",
                self.memory_mib
            )));
        }
        if self.root_drive.path_on_host.as_os_str().is_empty() {
            return Err(VmError::Config("root drive has no host path".into()));
        }
        match &self.network {
            Some(net) => net.validate(),
            None => Ok(()),
        }
    }
}

/// Configuration for a block device (drive).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriveConfig {
    /// Unique drive identifier
    pub drive_id: String,
    /// Path to drive image or block device on host
    pub path_on_host: PathBuf,
    /// Whether this is the root device
    pub is_root_device: bool,
    /// Read-only flag
    pub is_read_only: bool,
}

impl DriveConfig {
    /// Writable root device at `path`.
    pub fn root(path: impl Into<PathBuf>) -> Self {
        Self {
            drive_id: "rootfs".into(),
            path_on_host: path.into(),
            is_root_device: true,
            is_read_only: false,
        }
    }
}

/// Guest network interface wired to a host TAP device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkInterfaceConfig {
    /// Network interface ID
    pub iface_id: String,
    /// Host device name (tap device)
    pub host_dev_name: String,
    /// Guest MAC address
    pub guest_mac: String,
}

impl Default for NetworkInterfaceConfig {
    fn default() -> Self {
        Self {
            iface_id: "eth0".into(),
            host_dev_name: "tap0".into(),
            guest_mac: "06:00:AC:10:00:02".into(),
        }
    }
}

impl NetworkInterfaceConfig {
    fn validate(&self) -> Result<()> {
        // Linux caps interface names at 15 bytes
        if self.host_dev_name.is_empty() || self.host_dev_name.len() > 15 {
            return Err(VmError::Config(format!(
                "host_dev_name must be 1-15 bytes, got {:?}",
                self.host_dev_name
            )));
        }

        if !is_mac(&self.guest_mac) {
            return Err(VmError::Config(format!(
                "invalid guest_mac: {}",
                self.guest_mac
            )));
        }

        Ok(())
    }
}

fn is_mac(mac: &str) -> bool {
    let octets: Vec<&str> = mac.split(':').collect();
    octets.len() == 6
        && octets
            .iter()
            .all(|o| o.len() == 2 && u8::from_str_radix(o, 16).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_validate_vcpu() {
        let mut config = MachineConfig::default();
        config.vcpu_count = 0;
        assert_err!(config.validate());

        config.vcpu_count = 33;
        assert_err!(config.validate());

        config.vcpu_count = 4;
        assert_ok!(config.validate());
    }

    #[test]
    fn test_validate_memory() {
        let mut config = MachineConfig::default();
        config.memory_mib = 64;
        assert_err!(config.validate());

        config.memory_mib = 128;
        assert_ok!(config.validate());
    }

    #[test]
    fn test_validate_root_drive_path() {
        let mut config = MachineConfig::default();
        config.root_drive = DriveConfig::root("");
        assert!(config.validate().is_err());

        config.root_drive = DriveConfig::root("/dev/sandbox-vg/sandbox-1234abcd");
        assert!(config.validate().is_ok());
        assert!(config.root_drive.is_root_device);
    }

    #[test]
    fn test_validate_network_interface() {
        let mut config = MachineConfig::default();
        config.network = Some(NetworkInterfaceConfig {
            host_dev_name: "tap-1234abcd".into(),
            guest_mac: "06:00:AC:10:00:0a".into(),
            ..Default::default()
        });
        assert!(config.validate().is_ok());

        config.network = Some(NetworkInterfaceConfig {
            guest_mac: "06:00:AC:10:00".into(),
            ..Default::default()
        });
        assert!(config.validate().is_err());

        config.network = Some(NetworkInterfaceConfig {
            host_dev_name: "tap-this-name-is-too-long".into(),
            ..Default::default()
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_boot_args_use_sandbox_init() {
        let config = MachineConfig::default();
        assert!(config.boot_args.ends_with("init=/etc/sandbox/sandbox-init.sh"));
    }
}
