//! Workspace templates and the catalog they are read from.

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

/// Where a repository is cloned from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RepoSource {
    /// A configured git source with optional credentials.
    Source {
        #[serde(rename = "sourceId")]
        source_id: String,
        /// `owner/name`
        repo: String,
    },
    /// Any clone URL.
    Url { url: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoConfig {
    #[serde(flatten)]
    pub source: RepoSource,
    pub branch: String,
    /// Path under `/home/dev`, e.g. `/workspace/app`.
    pub clone_path: String,
}

impl RepoConfig {
    /// Human-readable name used in logs and summaries.
    pub fn display_name(&self) -> &str {
        match &self.source {
            RepoSource::Source { repo, .. } => repo,
            RepoSource::Url { url } => url,
        }
    }
}

/// A secret materialised as a file inside the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSecret {
    pub name: String,
    /// Absolute path; a leading `~` means `/home/dev`.
    pub path: String,
    /// Encrypted content.
    pub content: String,
    /// Octal mode string, `0600` when absent.
    #[serde(default)]
    pub mode: Option<String>,
}

/// Editor or tool configuration copied into the guest verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigFile {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrebuildStatus {
    #[default]
    None,
    Building,
    Ready,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuildInfo {
    pub status: PrebuildStatus,
    /// Sandbox the snapshot was taken from.
    pub latest_id: Option<String>,
    pub built_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkspaceConfig {
    pub base_image: String,
    pub vcpus: u8,
    pub memory_mb: u32,
    pub init_commands: Vec<String>,
    /// Encrypted environment secrets.
    pub secrets: BTreeMap<String, String>,
    pub file_secrets: Vec<FileSecret>,
    pub repos: Vec<RepoConfig>,
    pub config_files: Vec<ConfigFile>,
    pub prebuild: Option<PrebuildInfo>,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            base_image: "dev-base".into(),
            vcpus: 2,
            memory_mb: 2048,
            init_commands: Vec::new(),
            secrets: BTreeMap::new(),
            file_secrets: Vec::new(),
            repos: Vec::new(),
            config_files: Vec::new(),
            prebuild: None,
        }
    }
}

/// A reusable sandbox template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub config: WorkspaceConfig,
}

impl Workspace {
    pub fn prebuild_status(&self) -> PrebuildStatus {
        self.config
            .prebuild
            .as_ref()
            .map(|p| p.status)
            .unwrap_or_default()
    }
}

/// Credentials for cloning from a hosted git provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitSource {
    pub id: String,
    /// Encrypted access token.
    #[serde(default)]
    pub access_token: Option<String>,
}

/// Read access to workspaces plus the prebuild status they carry.
#[async_trait]
pub trait WorkspaceCatalog: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Workspace>>;

    async fn git_source(&self, id: &str) -> Result<Option<GitSource>>;

    /// Replace the prebuild status of a workspace.
    async fn set_prebuild(&self, id: &str, prebuild: PrebuildInfo) -> Result<()>;

    /// Mark a workspace `building` unless it already is, in one step.
    ///
    /// Returns the workspace as it was before the transition.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown workspaces, `InvalidState` while another
    /// prebuild is running.
    async fn begin_prebuild(&self, id: &str) -> Result<Workspace>;
}

/// Workspace catalog held in memory.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    workspaces: RwLock<HashMap<String, Workspace>>,
    sources: RwLock<HashMap<String, GitSource>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workspaces(workspaces: impl IntoIterator<Item = Workspace>) -> Self {
        Self {
            workspaces: RwLock::new(workspaces.into_iter().map(|w| (w.id.clone(), w)).collect()),
            sources: RwLock::default(),
        }
    }

    pub async fn insert(&self, workspace: Workspace) {
        self.workspaces
            .write()
            .await
            .insert(workspace.id.clone(), workspace);
    }

    pub async fn insert_source(&self, source: GitSource) {
        self.sources.write().await.insert(source.id.clone(), source);
    }
}

#[async_trait]
impl WorkspaceCatalog for InMemoryCatalog {
    async fn get(&self, id: &str) -> Result<Option<Workspace>> {
        Ok(self.workspaces.read().await.get(id).cloned())
    }

    async fn git_source(&self, id: &str) -> Result<Option<GitSource>> {
        Ok(self.sources.read().await.get(id).cloned())
    }

    async fn set_prebuild(&self, id: &str, prebuild: PrebuildInfo) -> Result<()> {
        let mut workspaces = self.workspaces.write().await;
        let workspace = workspaces
            .get_mut(id)
            .ok_or_else(|| crate::CoreError::not_found("workspace", id))?;
        workspace.config.prebuild = Some(prebuild);
        Ok(())
    }

    async fn begin_prebuild(&self, id: &str) -> Result<Workspace> {
        let mut workspaces = self.workspaces.write().await;
        let workspace = workspaces
            .get_mut(id)
            .ok_or_else(|| crate::CoreError::not_found("workspace", id))?;
        if workspace.prebuild_status() == PrebuildStatus::Building {
            return Err(crate::CoreError::InvalidState {
                expected: "no prebuild in progress".into(),
                actual: "building".into(),
            });
        }

        let before = workspace.clone();
        let prebuild = workspace.config.prebuild.get_or_insert_with(PrebuildInfo::default);
        prebuild.status = PrebuildStatus::Building;
        Ok(before)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repo_config_variants_deserialize() {
        let repos: Vec<RepoConfig> = serde_json::from_str(
            r#"[
                {"sourceId":"gh","repo":"acme/app","branch":"main","clonePath":"/workspace/app"},
                {"url":"https://example.com/lib.git","branch":"dev","clonePath":"/workspace/lib"}
            ]"#,
        )
        .unwrap();

        assert_eq!(
            repos[0].source,
            RepoSource::Source {
                source_id: "gh".into(),
                repo: "acme/app".into()
            }
        );
        assert_eq!(repos[0].display_name(), "acme/app");
        assert!(matches!(repos[1].source, RepoSource::Url { .. }));
        assert_eq!(repos[1].clone_path, "/workspace/lib");
    }

    #[test]
    fn test_workspace_config_defaults() {
        let workspace: Workspace = serde_json::from_str(r#"{"id":"ws","name":"Demo"}"#).unwrap();
        assert_eq!(workspace.config.base_image, "dev-base");
        assert_eq!(workspace.config.vcpus, 2);
        assert_eq!(workspace.config.memory_mb, 2048);
        assert_eq!(workspace.prebuild_status(), PrebuildStatus::None);
    }

    #[tokio::test]
    async fn test_set_prebuild_updates_status() {
        let catalog = InMemoryCatalog::with_workspaces([Workspace {
            id: "ws".into(),
            name: "Demo".into(),
            config: WorkspaceConfig::default(),
        }]);

        catalog
            .set_prebuild(
                "ws",
                PrebuildInfo {
                    status: PrebuildStatus::Ready,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let ws = catalog.get("ws").await.unwrap().unwrap();
        assert_eq!(ws.prebuild_status(), PrebuildStatus::Ready);
        assert!(catalog.set_prebuild("missing", PrebuildInfo::default()).await.is_err());
    }

    #[tokio::test]
    async fn test_begin_prebuild_admits_one_builder() {
        let catalog = InMemoryCatalog::with_workspaces([Workspace {
            id: "ws".into(),
            name: "Demo".into(),
            config: WorkspaceConfig {
                prebuild: Some(PrebuildInfo {
                    status: PrebuildStatus::Ready,
                    latest_id: Some("old".into()),
                    built_at: None,
                }),
                ..Default::default()
            },
        }]);

        let before = catalog.begin_prebuild("ws").await.unwrap();
        assert_eq!(before.prebuild_status(), PrebuildStatus::Ready);

        let now = catalog.get("ws").await.unwrap().unwrap();
        assert_eq!(now.prebuild_status(), PrebuildStatus::Building);
        assert_eq!(now.config.prebuild.unwrap().latest_id.as_deref(), Some("old"));

        assert!(matches!(
            catalog.begin_prebuild("ws").await.unwrap_err(),
            crate::CoreError::InvalidState { .. }
        ));
        assert!(matches!(
            catalog.begin_prebuild("missing").await.unwrap_err(),
            crate::CoreError::NotFound { .. }
        ));
    }
}
