//! Hypervisor seam used by the provisioning saga.

use crate::config::{PathsConfig, TimingConfig};
use crate::error::{CoreError, Result};
use crate::sandbox::SandboxId;
use async_trait::async_trait;
use kiln_vm::{LaunchOptions, MachineConfig, VirtualMachine, VmPaths};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;

/// Launches, configures, boots and kills one microVM per sandbox.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Start the hypervisor process and return its pid once it survived the
    /// startup window and its control socket answers.
    async fn launch(&self, id: &SandboxId) -> Result<u32>;

    async fn configure(&self, id: &SandboxId, machine: &MachineConfig) -> Result<()>;

    /// Start the guest and wait until it reports running.
    async fn boot(&self, id: &SandboxId) -> Result<()>;

    /// Kill the process and remove its runtime files. Never fails.
    ///
    /// `pid` is used when this instance did not launch the VM itself, e.g.
    /// after a restart; without it the pid file is consulted.
    async fn terminate(&self, id: &SandboxId, pid: Option<u32>, grace: Duration);
}

/// [`Hypervisor`] backed by Firecracker processes.
pub struct FirecrackerHypervisor {
    socket_dir: std::path::PathBuf,
    log_dir: std::path::PathBuf,
    options: LaunchOptions,
    boot_timeout: Duration,
    vms: Mutex<HashMap<SandboxId, VirtualMachine>>,
}

impl FirecrackerHypervisor {
    pub fn new(paths: &PathsConfig, timing: &TimingConfig) -> Self {
        Self {
            socket_dir: paths.socket_dir.clone(),
            log_dir: paths.log_dir.clone(),
            options: LaunchOptions {
                firecracker_path: paths.firecracker_path.clone(),
                startup_grace: timing.startup_grace,
                ..Default::default()
            },
            boot_timeout: timing.boot_timeout,
            vms: Mutex::new(HashMap::new()),
        }
    }

    /// Deterministic socket, pid and log paths of a sandbox.
    pub fn paths_for(&self, id: &SandboxId) -> VmPaths {
        VmPaths::for_sandbox(&self.socket_dir, &self.log_dir, &id.to_string())
    }

    async fn take(&self, id: &SandboxId) -> Result<VirtualMachine> {
        self.vms.lock().await.remove(id).ok_or_else(|| CoreError::InvalidState {
            expected: "launched".into(),
            actual: "no hypervisor process".into(),
        })
    }
}

#[async_trait]
impl Hypervisor for FirecrackerHypervisor {
    async fn launch(&self, id: &SandboxId) -> Result<u32> {
        let vm = VirtualMachine::launch(&id.to_string(), self.paths_for(id), &self.options).await?;
        let pid = vm.pid();
        self.vms.lock().await.insert(*id, vm);
        Ok(pid)
    }

    async fn configure(&self, id: &SandboxId, machine: &MachineConfig) -> Result<()> {
        let mut vm = self.take(id).await?;
        let result = vm.configure(machine).await;
        self.vms.lock().await.insert(*id, vm);
        Ok(result?)
    }

    async fn boot(&self, id: &SandboxId) -> Result<()> {
        let mut vm = self.take(id).await?;
        let result = vm.boot(self.boot_timeout).await;
        self.vms.lock().await.insert(*id, vm);
        Ok(result?)
    }

    async fn terminate(&self, id: &SandboxId, pid: Option<u32>, grace: Duration) {
        let tracked = self.vms.lock().await.remove(id);
        if let Some(vm) = tracked {
            if let Err(e) = vm.kill(grace).await {
                tracing::warn!(sandbox_id = %id, error = %e, "Failed to kill hypervisor");
            }
            return;
        }

        let paths = self.paths_for(id);
        let pid = match pid {
            Some(pid) => Some(pid),
            None => paths.read_pid().await,
        };
        if let Some(pid) = pid {
            if let Err(e) = kiln_vm::terminate(pid, grace).await {
                tracing::warn!(sandbox_id = %id, pid, error = %e, "Failed to kill hypervisor");
            }
        }
        paths.remove_runtime_files().await;
        tracing::debug!(sandbox_id = %id, ?pid, "Hypervisor terminated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hypervisor(dir: &std::path::Path, binary: &str) -> FirecrackerHypervisor {
        let paths = PathsConfig {
            socket_dir: dir.join("sockets"),
            log_dir: dir.join("logs"),
            firecracker_path: binary.into(),
            ..Default::default()
        };
        FirecrackerHypervisor::new(&paths, &TimingConfig::default())
    }

    #[tokio::test]
    async fn test_process_dying_at_startup_is_hypervisor_startup() {
        let dir = tempfile::tempdir().unwrap();
        // /bin/sh rejects the Firecracker flags and exits immediately.
        let hv = hypervisor(dir.path(), "/bin/sh");
        let id = SandboxId::new();

        let err = hv.launch(&id).await.unwrap_err();
        assert!(matches!(err, CoreError::HypervisorStartup(_)), "{err:?}");
        assert!(!hv.paths_for(&id).pid_file.exists());
    }

    #[tokio::test]
    async fn test_process_dying_before_socket_is_hypervisor_startup() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join("firecracker");
        std::fs::write(&binary, "#!/bin/sh\nsleep 0.3\necho 'KVM unavailable' >&2\nexit 1\n").unwrap();
        std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();
        let hv = hypervisor(dir.path(), binary.to_str().unwrap());
        let id = SandboxId::new();

        let start = std::time::Instant::now();
        let err = hv.launch(&id).await.unwrap_err();
        assert!(start.elapsed() < kiln_vm::SOCKET_TIMEOUT, "{:?}", start.elapsed());
        match err {
            CoreError::HypervisorStartup(message) => assert!(message.contains("KVM unavailable"), "{message}"),
            other => panic!("expected startup failure, got {other:?}"),
        }
        assert!(!hv.paths_for(&id).pid_file.exists());
    }

    #[tokio::test]
    async fn test_configure_without_launch_is_invalid_state() {
        let dir = tempfile::tempdir().unwrap();
        let hv = hypervisor(dir.path(), "/bin/sh");

        let err = hv
            .configure(&SandboxId::new(), &MachineConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidState { .. }));
        assert!(hv.boot(&SandboxId::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_terminate_untracked_removes_runtime_files() {
        let dir = tempfile::tempdir().unwrap();
        let hv = hypervisor(dir.path(), "/bin/sh");
        let id = SandboxId::new();
        let paths = hv.paths_for(&id);
        std::fs::create_dir_all(paths.socket.parent().unwrap()).unwrap();
        std::fs::write(&paths.socket, "").unwrap();

        hv.terminate(&id, None, Duration::from_millis(10)).await;
        hv.terminate(&id, None, Duration::from_millis(10)).await;
        assert!(!paths.socket.exists());
    }

    #[test]
    fn test_paths_are_deterministic() {
        let hv = hypervisor(std::path::Path::new("/run/kiln"), "/bin/sh");
        let id: SandboxId = "1234abcd-0000-4000-8000-000000000000".parse().unwrap();
        let paths = hv.paths_for(&id);
        assert_eq!(
            paths.socket,
            std::path::PathBuf::from("/run/kiln/sockets/1234abcd-0000-4000-8000-000000000000.sock")
        );
        assert_eq!(paths, hv.paths_for(&id));
    }
}
