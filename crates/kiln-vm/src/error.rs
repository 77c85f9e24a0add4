//! Error types for kiln-vm.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for kiln-vm operations.
pub type Result<T> = std::result::Result<T, VmError>;

/// Errors that can occur while launching or driving a microVM.
#[derive(Debug, Error)]
pub enum VmError {
    /// The Firecracker process exited inside the startup grace window.
    #[error("firecracker exited during startup ({status}): {log}")]
    Startup {
        /// Exit status as reported by the OS
        status: String,
        /// Captured process log
        log: String,
    },

    /// The control socket answered with a non-success status.
    #[error("firecracker API {method} {path} failed with status {status}: {body}")]
    Api {
        method: String,
        path: String,
        status: u16,
        body: String,
    },

    /// Request could not be delivered over the control socket.
    #[error("control socket transport error: {0}")]
    Transport(String),

    /// VM is not in expected state
    #[error("invalid VM state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error on a control-socket body
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Timeout waiting for operation
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
}
