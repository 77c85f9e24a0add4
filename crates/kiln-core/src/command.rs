//! Host command execution.
//!
//! LVM, TAP and mount handling all shell out to host tools. They go through
//! [`CommandRunner`] so a synthetic host can stand in for the real one.

use crate::error::{CoreError, Result};
use async_trait::async_trait;
use std::process::Stdio;

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `-1` when killed by a signal.
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// A successful run with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(status: i32, stderr: impl Into<String>) -> Self {
        Self {
            status,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` to completion. A non-zero exit is not an error here.
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput>;

    /// Run `program` and fail with [`CoreError::Command`] on a non-zero exit.
    async fn run_checked(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        let output = self.run(program, args).await?;
        if !output.success() {
            return Err(CoreError::Command {
                program: program.to_string(),
                status: output.status,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output)
    }
}

/// Runs commands on the host.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        tracing::trace!(program, ?args, "Running host command");
        let output = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await?;

        let result = CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        if !result.success() {
            tracing::debug!(program, status = result.status, stderr = %result.stderr.trim(), "Host command failed");
        }
        Ok(result)
    }
}

/// Logs commands instead of running them; every command succeeds.
#[derive(Debug, Default, Clone, Copy)]
pub struct DryRunRunner;

#[async_trait]
impl CommandRunner for DryRunRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        tracing::debug!(program, ?args, "Dry run, skipping host command");
        Ok(CommandOutput::ok(""))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_system_runner_captures_output() {
        let out = SystemRunner
            .run("/bin/sh", &["-c", "echo out; echo err >&2; exit 3"])
            .await
            .unwrap();
        assert_eq!(out.status, 3);
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
    }

    #[tokio::test]
    async fn test_run_checked_maps_failure() {
        let err = SystemRunner
            .run_checked("/bin/sh", &["-c", "echo nope >&2; exit 5"])
            .await
            .unwrap_err();
        match err {
            CoreError::Command { status, stderr, .. } => {
                assert_eq!(status, 5);
                assert_eq!(stderr, "nope");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dry_run_always_succeeds() {
        let out = DryRunRunner
            .run_checked("/usr/sbin/lvcreate", &["-s"])
            .await
            .unwrap();
        assert!(out.success());
    }
}
