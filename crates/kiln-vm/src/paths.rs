//! Deterministic on-host locations for one microVM.

use std::path::{Path, PathBuf};

/// Socket, pid-file and log locations for a sandbox.
///
/// Every path is derived from the sandbox id alone so a restarted
/// controller can find the processes it launched earlier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmPaths {
    /// Firecracker API socket
    pub socket: PathBuf,
    /// File holding the Firecracker pid
    pub pid_file: PathBuf,
    /// Firecracker log output
    pub log_file: PathBuf,
}

impl VmPaths {
    /// Derive the paths for `id` under the given socket and log directories.
    pub fn for_sandbox(socket_dir: &Path, log_dir: &Path, id: &str) -> Self {
        Self {
            socket: socket_dir.join(format!("{id}.sock")),
            pid_file: socket_dir.join(format!("{id}.pid")),
            log_file: log_dir.join(format!("{id}.log")),
        }
    }

    /// Read the pid recorded for this VM, if any.
    pub async fn read_pid(&self) -> Option<u32> {
        let raw = tokio::fs::read_to_string(&self.pid_file).await.ok()?;
        raw.trim().parse().ok()
    }

    /// Remove the socket and pid file. Missing files are ignored.
    pub async fn remove_runtime_files(&self) {
        for path in [&self.socket, &self.pid_file] {
            match tokio::fs::remove_file(path).await {
                Ok(()) => tracing::trace!(path = %path.display(), "Removed runtime file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to remove runtime file")
                }
            }
        }
    }
}
