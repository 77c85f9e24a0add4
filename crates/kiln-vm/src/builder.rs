//! Builder pattern for ergonomic machine configuration.

use crate::config::{MachineConfig, NetworkInterfaceConfig};
use crate::error::Result;
use crate::paths::VmPaths;
use crate::process::LaunchOptions;
use crate::VirtualMachine;
use std::path::PathBuf;

/// Fluent builder for [`MachineConfig`].
///
/// # Example
///
/// ```no_run
/// use kiln_vm::{LaunchOptions, VmBuilder, VmPaths};
/// use std::path::Path;
///
/// # async fn example() -> kiln_vm::Result<()> {
/// let paths = VmPaths::for_sandbox(Path::new("/var/lib/sandbox/sockets"), Path::new("/var/log/sandbox"), "demo");
/// let vm = VmBuilder::new()
///     .vcpus(2)
///     .memory_mib(2048)
///     .kernel("/path/to/vmlinux")
///     .rootfs("/dev/sandbox-vg/sandbox-demo")
///     .with_network("tap-demo", "06:00:AC:10:00:0a")
///     .launch("demo", paths, &LaunchOptions::default())
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct VmBuilder {
    config: MachineConfig,
}

impl Default for VmBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl VmBuilder {
    /// Create a new builder with default configuration.
    pub fn new() -> Self {
        Self {
            config: MachineConfig::default(),
        }
    }

    /// Set the number of virtual CPUs (1-32).
    pub fn vcpus(mut self, count: u8) -> Self {
        self.config.vcpu_count = count;
        self
    }

    /// Set the memory size in MiB.
    pub fn memory_mib(mut self, mib: u32) -> Self {
        self.config.memory_mib = mib;
        self
    }

    /// Set the path to the kernel image.
    pub fn kernel(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.kernel_path = path.into();
        self
    }

    /// Set the kernel boot arguments.
    pub fn boot_args(mut self, args: impl Into<String>) -> Self {
        self.config.boot_args = args.into();
        self
    }

    /// Set the root filesystem: an image file or a block device.
    pub fn rootfs(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.root_drive.path_on_host = path.into();
        self
    }

    /// Attach `eth0` to the given TAP device with a fixed guest MAC.
    pub fn with_network(mut self, host_dev: &str, guest_mac: &str) -> Self {
        self.config.network = Some(NetworkInterfaceConfig {
            host_dev_name: host_dev.to_string(),
            guest_mac: guest_mac.to_string(),
            ..Default::default()
        });
        self
    }

    /// Apply a CPU template file when it exists.
    pub fn cpu_template(mut self, path: Option<PathBuf>) -> Self {
        self.config.cpu_template = path;
        self
    }

    /// Build and return the configuration without launching anything.
    pub fn build_config(self) -> MachineConfig {
        self.config
    }

    /// Launch Firecracker and apply this configuration. The guest is not started.
    ///
    /// # Errors
    /// Returns an error if the process fails to start or rejects the configuration.
    pub async fn launch(
        self,
        id: &str,
        paths: VmPaths,
        options: &LaunchOptions,
    ) -> Result<VirtualMachine> {
        self.config.validate()?;
        let mut vm = VirtualMachine::launch(id, paths, options).await?;
        if let Err(e) = vm.configure(&self.config).await {
            let pid = vm.pid();
            if let Err(kill_err) = vm.kill(std::time::Duration::from_millis(100)).await {
                tracing::warn!(vm_id = %id, pid, error = %kill_err, "Failed to kill unconfigured MicroVM");
            }
            return Err(e);
        }
        Ok(vm)
    }
}
