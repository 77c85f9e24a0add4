//! Firecracker process supervision.
//!
//! The control socket only appears some time after the process starts, and a
//! misconfigured host makes Firecracker exit immediately. Launching therefore
//! waits out a short grace window and reports an early exit together with the
//! captured log. Exits after the window are published on a watch channel so
//! callers still waiting for the socket can notice them.

use crate::error::{Result, VmError};
use crate::paths::VmPaths;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::watch;

/// How long a freshly spawned process must stay alive to count as started.
pub const STARTUP_GRACE: Duration = Duration::from_millis(50);

/// Options for spawning the Firecracker binary.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    /// Path to Firecracker binary
    pub firecracker_path: PathBuf,
    /// Value for `--level`
    pub log_level: String,
    /// Survival window before the launch counts as successful
    pub startup_grace: Duration,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            firecracker_path: PathBuf::from("/usr/local/bin/firecracker"),
            log_level: "Warning".into(),
            startup_grace: STARTUP_GRACE,
        }
    }
}

/// A spawned Firecracker process whose exit is observed by a reaper task.
pub struct FirecrackerProcess {
    pub pid: u32,
    exit: watch::Receiver<Option<String>>,
}

impl FirecrackerProcess {
    /// Exit status, if the process has already exited.
    pub fn exit_status(&self) -> Option<String> {
        self.exit.borrow().clone()
    }

    /// Resolve with the exit status once the process exits.
    ///
    /// Never resolves if the reaper task went away without observing an exit.
    pub async fn exited(&mut self) -> String {
        let result = self
            .exit
            .wait_for(Option::is_some)
            .await
            .map(|status| status.clone().unwrap_or_default());
        match result {
            Ok(status) => status,
            Err(_) => std::future::pending().await,
        }
    }
}

/// Spawn Firecracker for the given paths and return its pid.
///
/// See [`spawn_supervised`].
pub async fn spawn_firecracker(paths: &VmPaths, options: &LaunchOptions) -> Result<u32> {
    spawn_supervised(paths, options).await.map(|process| process.pid)
}

/// Spawn Firecracker and keep a handle on its exit status.
///
/// The pid is written to `paths.pid_file`. stdout and stderr are appended to
/// the log file so early failures can be reported verbatim.
///
/// # Errors
/// Returns [`VmError::Startup`] if the process exits inside the grace window.
pub async fn spawn_supervised(paths: &VmPaths, options: &LaunchOptions) -> Result<FirecrackerProcess> {
    for dir in [paths.socket.parent(), paths.log_file.parent()]
        .into_iter()
        .flatten()
    {
        tokio::fs::create_dir_all(dir).await?;
    }

    // A stale socket makes Firecracker refuse to bind
    if let Err(e) = tokio::fs::remove_file(&paths.socket).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            return Err(e.into());
        }
    }

    let log = std::fs::File::create(&paths.log_file)?;
    let stderr_log = log.try_clone()?;

    tracing::debug!(
        binary = %options.firecracker_path.display(),
        socket = %paths.socket.display(),
        log = %paths.log_file.display(),
        "Spawning firecracker"
    );

    let mut child = Command::new(&options.firecracker_path)
        .arg("--api-sock")
        .arg(&paths.socket)
        .arg("--log-path")
        .arg(&paths.log_file)
        .arg("--level")
        .arg(&options.log_level)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(stderr_log))
        .spawn()?;

    let pid = child.id().ok_or_else(|| VmError::InvalidState {
        expected: "running process".into(),
        actual: "exited before pid was read".into(),
    })?;
    tokio::fs::write(&paths.pid_file, pid.to_string()).await?;

    tokio::time::sleep(options.startup_grace).await;

    if let Some(status) = child.try_wait()? {
        let log = read_log(paths).await;
        if let Err(e) = tokio::fs::remove_file(&paths.pid_file).await {
            tracing::debug!(pid, error = %e, "Failed to remove pid file");
        }
        tracing::error!(pid, status = %status, "Firecracker exited during startup");
        return Err(VmError::Startup {
            status: status.to_string(),
            log,
        });
    }

    // Reap the process whenever it exits so it never lingers as a zombie
    let (exit_tx, exit_rx) = watch::channel(None);
    tokio::spawn(async move {
        let status = match child.wait().await {
            Ok(status) => status.to_string(),
            Err(e) => format!("wait failed: {e}"),
        };
        tracing::debug!(pid, status = %status, "Firecracker process exited");
        exit_tx.send_replace(Some(status));
    });

    tracing::info!(pid, socket = %paths.socket.display(), "Firecracker process started");
    Ok(FirecrackerProcess { pid, exit: exit_rx })
}

/// Contents of the Firecracker log, empty if it cannot be read.
pub async fn read_log(paths: &VmPaths) -> String {
    tokio::fs::read_to_string(&paths.log_file)
        .await
        .unwrap_or_default()
}

/// Check whether a process with this pid exists.
pub fn is_alive(pid: u32) -> bool {
    signal::kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// Stop a process with SIGTERM, escalating to SIGKILL after `grace`.
///
/// A process that is already gone counts as terminated.
pub async fn terminate(pid: u32, grace: Duration) -> Result<()> {
    let target = Pid::from_raw(pid as i32);

    match signal::kill(target, Signal::SIGTERM) {
        Ok(()) => {}
        Err(Errno::ESRCH) => {
            tracing::debug!(pid, "Process already exited");
            return Ok(());
        }
        Err(e) => return Err(VmError::Io(e.into())),
    }

    tokio::time::sleep(grace).await;

    if is_alive(pid) {
        tracing::warn!(pid, grace_ms = grace.as_millis() as u64, "Process ignored SIGTERM, killing");
        match signal::kill(target, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => return Err(VmError::Io(e.into())),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    /// Write an executable shell script standing in for Firecracker.
    fn fake_binary(dir: &std::path::Path, body: &str) -> PathBuf {
        let path = dir.join("firecracker");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn test_early_exit_reports_startup_failure_with_log() {
        let dir = tempfile::tempdir().unwrap();
        let paths = VmPaths::for_sandbox(dir.path(), dir.path(), "early-exit");

        // sh rejects the firecracker flags and exits with a diagnostic
        let options = LaunchOptions {
            firecracker_path: PathBuf::from("/bin/sh"),
            startup_grace: Duration::from_millis(500),
            ..Default::default()
        };

        let err = spawn_firecracker(&paths, &options).await.unwrap_err();
        match err {
            VmError::Startup { log, .. } => assert!(!log.is_empty()),
            other => panic!("expected startup failure, got {other:?}"),
        }
        assert!(!paths.pid_file.exists());
    }

    #[tokio::test]
    async fn test_exit_after_grace_is_published() {
        let dir = tempfile::tempdir().unwrap();
        let paths = VmPaths::for_sandbox(dir.path(), dir.path(), "late-exit");
        let script = fake_binary(dir.path(), "sleep 0.2\nexit 3");

        let options = LaunchOptions {
            firecracker_path: script,
            startup_grace: Duration::from_millis(20),
            ..Default::default()
        };
        let mut process = spawn_supervised(&paths, &options).await.unwrap();
        assert!(process.exit_status().is_none());

        let status = tokio::time::timeout(Duration::from_secs(5), process.exited())
            .await
            .unwrap();
        assert!(status.contains('3'), "{status}");
        assert_eq!(process.exit_status(), Some(status));
    }

    #[tokio::test]
    async fn test_missing_binary_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let paths = VmPaths::for_sandbox(dir.path(), dir.path(), "missing");
        let options = LaunchOptions {
            firecracker_path: dir.path().join("no-such-firecracker"),
            ..Default::default()
        };

        let err = spawn_firecracker(&paths, &options).await.unwrap_err();
        assert!(matches!(err, VmError::Io(_)));
    }

    #[tokio::test]
    async fn test_terminate_missing_process_is_ok() {
        // pid_max on Linux never reaches this value
        assert!(!is_alive(i32::MAX as u32));
        terminate(i32::MAX as u32, Duration::from_millis(1))
            .await
            .unwrap();
    }
}
