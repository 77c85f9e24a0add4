//! HTTP client for the in-guest agent and the readiness gate built on it.
//!
//! The agent listens on the private bridge network. Health polling swallows
//! connection errors because the guest OS is usually still booting when the
//! first polls arrive; `exec` is never retried.

use crate::config::AgentWait;
use crate::error::{CoreError, Result};
use async_trait::async_trait;
use hyper::client::HttpConnector;
use hyper::{Body, Client, Method, Request};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::{timeout, Instant};

/// Deadline for one health request.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Added to the command timeout to get the HTTP deadline of an exec call.
const EXEC_SLACK: Duration = Duration::from_secs(5);

/// Answer of `GET /health`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentHealth {
    pub status: String,
    pub sandbox_id: Option<String>,
    pub services: BTreeMap<String, bool>,
    pub uptime: u64,
}

impl AgentHealth {
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

#[derive(Debug, Serialize)]
struct ExecRequest<'a> {
    command: &'a str,
    /// Milliseconds.
    timeout: u64,
}

/// Answer of `POST /exec`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Health and command execution inside a guest.
#[async_trait]
pub trait GuestAgent: Send + Sync {
    async fn health(&self, host: &str) -> Result<AgentHealth>;

    /// Run a shell command in the guest. A non-zero exit is not an error.
    async fn exec(&self, host: &str, command: &str, timeout: Duration) -> Result<ExecResult>;

    /// Poll [`health`](Self::health) every `wait.interval` until the agent
    /// reports healthy or `wait.timeout` elapses. A single poll never runs
    /// past the deadline.
    ///
    /// Returns `false` on deadline expiry, never an error.
    async fn wait_for_agent(&self, host: &str, wait: AgentWait) -> bool {
        let start = Instant::now();
        let deadline = start + wait.timeout;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(remaining.min(HEALTH_TIMEOUT), self.health(host)).await {
                Ok(Ok(health)) if health.is_healthy() => {
                    tracing::info!(
                        host,
                        attempts,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "Agent ready"
                    );
                    return true;
                }
                Ok(Ok(health)) => {
                    tracing::trace!(host, status = %health.status, attempt = attempts, "Agent not healthy yet");
                }
                Ok(Err(e)) => {
                    tracing::trace!(host, error = %e, attempt = attempts, "Agent poll failed, retrying...");
                }
                Err(_) => {
                    tracing::trace!(host, attempt = attempts, "Agent poll timed out");
                }
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(
                    host,
                    attempts,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Agent readiness timeout"
                );
                return false;
            }
            tokio::time::sleep(wait.interval.min(deadline - now)).await;
        }
    }
}

/// [`GuestAgent`] speaking HTTP to the agent port of each guest.
#[derive(Clone)]
pub struct AgentClient {
    client: Client<HttpConnector>,
    port: u16,
}

impl AgentClient {
    pub fn new(port: u16) -> Self {
        Self {
            client: Client::new(),
            port,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    fn uri(&self, host: &str, path: &str) -> String {
        format!("http://{host}:{}{path}", self.port)
    }

    async fn send(&self, request: Request<Body>, deadline: Duration) -> Result<Vec<u8>> {
        let target = request.uri().to_string();
        let response = timeout(deadline, self.client.request(request))
            .await
            .map_err(|_| CoreError::Agent(format!("{target} timed out after {deadline:?}")))?
            .map_err(|e| CoreError::Agent(format!("{target} failed: {e}")))?;

        let status = response.status();
        let body = hyper::body::to_bytes(response.into_body())
            .await
            .map_err(|e| CoreError::Agent(format!("{target} body read failed: {e}")))?;
        if !status.is_success() {
            return Err(CoreError::Agent(format!(
                "{target} returned {status}: {}",
                String::from_utf8_lossy(&body)
            )));
        }
        Ok(body.to_vec())
    }
}

#[async_trait]
impl GuestAgent for AgentClient {
    async fn health(&self, host: &str) -> Result<AgentHealth> {
        let request = Request::builder()
            .method(Method::GET)
            .uri(self.uri(host, "/health"))
            .body(Body::empty())
            .map_err(|e| CoreError::Agent(format!("failed to build health request: {e}")))?;
        let body = self.send(request, HEALTH_TIMEOUT).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn exec(&self, host: &str, command: &str, cmd_timeout: Duration) -> Result<ExecResult> {
        let start = std::time::Instant::now();
        let payload = serde_json::to_vec(&ExecRequest {
            command,
            timeout: cmd_timeout.as_millis() as u64,
        })?;
        let request = Request::builder()
            .method(Method::POST)
            .uri(self.uri(host, "/exec"))
            .header("Content-Type", "application/json")
            .body(Body::from(payload))
            .map_err(|e| CoreError::Agent(format!("failed to build exec request: {e}")))?;

        let body = self.send(request, cmd_timeout + EXEC_SLACK).await?;
        let result: ExecResult = serde_json::from_slice(&body)?;
        tracing::debug!(
            host,
            exit_code = result.exit_code,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Agent exec finished"
        );
        Ok(result)
    }
}
