//! Error types for kiln-core.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for kiln-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur while provisioning or managing sandboxes.
#[derive(Debug, Error)]
pub enum CoreError {
    /// No free address left in the guest subnet
    #[error("no free IP address in {subnet}.{first}-{last}")]
    ResourceExhausted { subnet: String, first: u8, last: u8 },

    /// Thin pool is missing; callers fall back to full-copy overlays
    #[error("storage pool {0} is not available")]
    StorageUnavailable(String),

    /// Hypervisor process died before its control socket was usable
    #[error("hypervisor failed to start: {0}")]
    HypervisorStartup(String),

    /// Guest did not reach the running state in time
    #[error("boot timed out after {0:?}")]
    BootTimeout(Duration),

    /// Guest agent never became healthy
    #[error("agent unreachable at {host} after {timeout:?}")]
    AgentUnreachable { host: String, timeout: Duration },

    /// Repository clone inside the guest failed
    #[error("failed to clone {repo}: {message}")]
    CloneFailure { repo: String, message: String },

    /// Workspace init command exited non-zero during a prebuild
    #[error("init command `{command}` exited with {exit_code}: {stderr}")]
    InitCommand {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    /// Proxy admin API refused or failed a route update
    #[error("proxy registration failed: {0}")]
    ProxyRegistration(String),

    /// Host command exited unsuccessfully
    #[error("{program} exited with status {status}: {stderr}")]
    Command {
        program: String,
        status: i32,
        stderr: String,
    },

    /// Guest agent call failed
    #[error("agent error: {0}")]
    Agent(String),

    /// Sandbox, workspace or job not found
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Invalid state for operation
    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Waiting for a queued job exceeded its deadline
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Persistence boundary failure
    #[error("repository error: {0}")]
    Repository(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Error from kiln-vm
    #[error("VM error: {0}")]
    Vm(kiln_vm::VmError),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    pub(crate) fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

impl From<kiln_vm::VmError> for CoreError {
    fn from(err: kiln_vm::VmError) -> Self {
        match err {
            kiln_vm::VmError::Startup { status, log } => {
                Self::HypervisorStartup(format!("{status}: {}", log.trim()))
            }
            kiln_vm::VmError::Timeout(after) => Self::BootTimeout(after),
            other => Self::Vm(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vm_startup_maps_to_hypervisor_startup() {
        let err: CoreError = kiln_vm::VmError::Startup {
            status: "exit status: 1".into(),
            log: "KVM not available\n".into(),
        }
        .into();
        match err {
            CoreError::HypervisorStartup(msg) => assert!(msg.contains("KVM not available")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_vm_timeout_maps_to_boot_timeout() {
        let err: CoreError = kiln_vm::VmError::Timeout(Duration::from_secs(30)).into();
        assert!(matches!(err, CoreError::BootTimeout(d) if d == Duration::from_secs(30)));
    }

    #[test]
    fn test_other_vm_errors_are_wrapped() {
        let err: CoreError = kiln_vm::VmError::Config("bad".into()).into();
        assert!(matches!(err, CoreError::Vm(_)));
    }
}
