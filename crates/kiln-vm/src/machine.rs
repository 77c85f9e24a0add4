//! VirtualMachine type - main interface for managing one Firecracker microVM.

use crate::client::{FirecrackerClient, SOCKET_TIMEOUT};
use crate::config::MachineConfig;
use crate::error::{Result, VmError};
use crate::paths::VmPaths;
use crate::process::{self, LaunchOptions};
use std::time::Duration;

/// Current state of the VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    /// Process is up, machine not yet configured
    Launched,
    /// Boot source, drives and network applied
    Configured,
    /// Guest is running
    Running,
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmState::Launched => write!(f, "launched"),
            VmState::Configured => write!(f, "configured"),
            VmState::Running => write!(f, "running"),
        }
    }
}

/// A Firecracker process and its control socket.
pub struct VirtualMachine {
    id: String,
    pid: u32,
    paths: VmPaths,
    client: FirecrackerClient,
    state: VmState,
}

impl VirtualMachine {
    /// Spawn Firecracker and wait for its control socket.
    ///
    /// # Errors
    /// Returns [`VmError::Startup`] when the process exits before its socket
    /// answers, or [`VmError::Timeout`] when the socket never appears.
    pub async fn launch(id: &str, paths: VmPaths, options: &LaunchOptions) -> Result<Self> {
        Self::launch_within(id, paths, options, SOCKET_TIMEOUT).await
    }

    pub(crate) async fn launch_within(
        id: &str,
        paths: VmPaths,
        options: &LaunchOptions,
        socket_timeout: Duration,
    ) -> Result<Self> {
        let start = std::time::Instant::now();
        tracing::info!(vm_id = %id, "Launching MicroVM");

        let mut child = process::spawn_supervised(&paths, options).await?;
        let pid = child.pid;
        let client = FirecrackerClient::new(&paths.socket);

        let ready = tokio::select! {
            result = client.wait_for_socket(socket_timeout) => result,
            status = child.exited() => Err(VmError::Startup {
                status,
                log: process::read_log(&paths).await,
            }),
        };

        if let Err(e) = ready {
            tracing::error!(vm_id = %id, pid, error = %e, "Control socket never came up");
            if child.exit_status().is_none() {
                if let Err(kill_err) = process::terminate(pid, Duration::from_millis(100)).await {
                    tracing::warn!(vm_id = %id, pid, error = %kill_err, "Failed to terminate Firecracker");
                }
            }
            paths.remove_runtime_files().await;
            return Err(e);
        }

        tracing::info!(
            vm_id = %id,
            pid,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "MicroVM process ready"
        );

        Ok(Self {
            id: id.to_string(),
            pid,
            paths,
            client,
            state: VmState::Launched,
        })
    }

    /// Reattach to a VM launched earlier, using its pid file.
    ///
    /// Returns `None` when no live process is recorded for these paths.
    pub async fn attach(id: &str, paths: VmPaths) -> Option<Self> {
        let pid = paths.read_pid().await?;
        if !process::is_alive(pid) {
            return None;
        }
        let client = FirecrackerClient::new(&paths.socket);
        let state = if client.is_running().await {
            VmState::Running
        } else {
            VmState::Launched
        };
        Some(Self {
            id: id.to_string(),
            pid,
            paths,
            client,
            state,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn state(&self) -> VmState {
        self.state
    }

    pub fn paths(&self) -> &VmPaths {
        &self.paths
    }

    pub fn client(&self) -> &FirecrackerClient {
        &self.client
    }

    /// Apply boot source, root drive, network, CPU template and machine size.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or Firecracker rejects a call.
    pub async fn configure(&mut self, config: &MachineConfig) -> Result<()> {
        if self.state != VmState::Launched {
            return Err(VmError::InvalidState {
                expected: VmState::Launched.to_string(),
                actual: self.state.to_string(),
            });
        }
        config.validate()?;

        tracing::debug!(vm_id = %self.id, "Configuring MicroVM");
        self.client
            .set_boot_source(&config.kernel_path, &config.boot_args)
            .await?;
        self.client.set_drive(&config.root_drive).await?;
        if let Some(net) = &config.network {
            self.client.set_network_interface(net).await?;
        }
        if let Some(template) = &config.cpu_template {
            let applied = self.client.set_cpu_config(template).await;
            tracing::debug!(vm_id = %self.id, applied, "CPU template");
        }
        self.client
            .set_machine_config(config.vcpu_count, config.memory_mib)
            .await?;

        self.state = VmState::Configured;
        tracing::info!(
            vm_id = %self.id,
            vcpus = config.vcpu_count,
            memory_mib = config.memory_mib,
            "MicroVM configured"
        );
        Ok(())
    }

    /// Issue `InstanceStart` and wait until the instance reports running.
    ///
    /// # Errors
    /// Returns [`VmError::Timeout`] if the guest does not reach `Running` in time.
    pub async fn boot(&mut self, timeout: Duration) -> Result<()> {
        if self.state != VmState::Configured {
            return Err(VmError::InvalidState {
                expected: VmState::Configured.to_string(),
                actual: self.state.to_string(),
            });
        }

        let start = std::time::Instant::now();
        self.client.start().await?;
        self.client.wait_for_running(timeout).await?;
        self.state = VmState::Running;

        tracing::info!(
            vm_id = %self.id,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "MicroVM booted"
        );
        Ok(())
    }

    /// Terminate the process and remove the socket and pid files.
    pub async fn kill(self, grace: Duration) -> Result<()> {
        tracing::info!(vm_id = %self.id, pid = self.pid, "Killing MicroVM");
        let result = process::terminate(self.pid, grace).await;
        self.paths.remove_runtime_files().await;
        result
    }
}
