//! Sandbox records as stored by the persistence boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SandboxId(Uuid);

impl SandboxId {
    /// Create a new random sandbox ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// First eight hex characters, used for host device names.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for SandboxId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SandboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for SandboxId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for SandboxId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Externally visible sandbox state.
///
/// `Creating` is the only transient state; a failed build ends in `Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    Creating,
    Running,
    Stopped,
    Error,
}

impl fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Creating => write!(f, "creating"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Public entry points of a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SandboxUrls {
    pub vscode: String,
    pub opencode: String,
    pub terminal: String,
    pub ssh: String,
}

impl SandboxUrls {
    pub fn all_present(&self) -> bool {
        [&self.vscode, &self.opencode, &self.terminal, &self.ssh]
            .iter()
            .all(|u| !u.is_empty())
    }
}

/// Runtime facts filled in as the provisioning saga progresses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxRuntime {
    /// Set once the address is allocated.
    pub ip_address: Option<String>,
    /// Set together with `ip_address`.
    pub mac_address: Option<String>,
    pub urls: Option<SandboxUrls>,
    pub vcpus: u8,
    pub memory_mb: u32,
    /// Set once the hypervisor process survived its startup window.
    pub pid: Option<u32>,
    pub error: Option<String>,
}

/// The durable sandbox record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sandbox {
    pub id: SandboxId,
    pub workspace_id: Option<String>,
    pub status: SandboxStatus,
    pub runtime: SandboxRuntime,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Sandbox {
    /// A fresh record in the `creating` state.
    pub fn creating(id: SandboxId, workspace_id: Option<String>, runtime: SandboxRuntime) -> Self {
        let now = Utc::now();
        Self {
            id,
            workspace_id,
            status: SandboxStatus::Creating,
            runtime,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == SandboxStatus::Running
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Parameters of a sandbox build.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateSandboxRequest {
    pub workspace_id: Option<String>,
    pub base_image: Option<String>,
    pub vcpus: Option<u8>,
    pub memory_mb: Option<u32>,
}

impl CreateSandboxRequest {
    /// Request a sandbox built from a workspace template.
    pub fn for_workspace(workspace_id: impl Into<String>) -> Self {
        Self {
            workspace_id: Some(workspace_id.into()),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sandbox_id_short_is_eight_hex_chars() {
        let id: SandboxId = "1234abcd-0000-4000-8000-000000000000".parse().unwrap();
        assert_eq!(id.short(), "1234abcd");
        assert_eq!(SandboxId::new().short().len(), 8);
    }

    #[test]
    fn test_sandbox_serializes_camel_case() {
        let id = SandboxId::new();
        let sandbox = Sandbox::creating(
            id,
            Some("ws-1".into()),
            SandboxRuntime {
                vcpus: 2,
                memory_mb: 2048,
                ..Default::default()
            },
        );
        let json = serde_json::to_value(&sandbox).unwrap();
        assert_eq!(json["status"], "creating");
        assert_eq!(json["workspaceId"], "ws-1");
        assert_eq!(json["runtime"]["memoryMb"], 2048);
        assert_eq!(json["id"], id.to_string());
    }

    #[test]
    fn test_create_request_accepts_partial_json() {
        let req: CreateSandboxRequest =
            serde_json::from_str(r#"{"workspaceId":"ws-1","vcpus":4}"#).unwrap();
        assert_eq!(req.workspace_id.as_deref(), Some("ws-1"));
        assert_eq!(req.vcpus, Some(4));
        assert!(req.memory_mb.is_none());
    }

    #[test]
    fn test_urls_all_present() {
        let mut urls = SandboxUrls {
            vscode: "https://a".into(),
            opencode: "https://b".into(),
            terminal: "https://c".into(),
            ssh: "ssh root@172.16.0.10".into(),
        };
        assert!(urls.all_present());
        urls.terminal.clear();
        assert!(!urls.all_present());
    }
}
