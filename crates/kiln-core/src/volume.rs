//! Copy-on-write root volumes on an LVM thin pool.
//!
//! Sandbox volumes are thin snapshots, so creating one costs the same no
//! matter how large the base image is. A workspace may own one golden
//! "prebuild" volume that later sandboxes snapshot instead of the base image.

use crate::command::CommandRunner;
use crate::config::StorageConfig;
use crate::error::{CoreError, Result};
use crate::sandbox::SandboxId;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Inputs for choosing a snapshot origin.
#[derive(Debug, Clone, Default)]
pub struct VolumeSource {
    /// Workspace whose prebuild should be preferred.
    pub workspace_id: Option<String>,
    pub base_image: Option<String>,
}

/// Root disk backing a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RootDisk {
    /// Thin snapshot block device.
    Volume(PathBuf),
    /// Full copy of the base rootfs, used when the pool is missing.
    Overlay(PathBuf),
}

impl RootDisk {
    pub fn path(&self) -> &PathBuf {
        match self {
            Self::Volume(p) | Self::Overlay(p) => p,
        }
    }

    pub fn is_overlay(&self) -> bool {
        matches!(self, Self::Overlay(_))
    }
}

/// LVM-backed volume manager.
pub struct VolumeManager {
    config: StorageConfig,
    runner: Arc<dyn CommandRunner>,
    /// One lock per volume name; concurrent mutations of a name are serialised.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl VolumeManager {
    pub fn new(config: StorageConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            config,
            runner,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn sandbox_volume_name(&self, id: &SandboxId) -> String {
        format!("{}{id}", self.config.sandbox_prefix)
    }

    pub fn prebuild_volume_name(&self, workspace_id: &str) -> String {
        format!("{}{workspace_id}", self.config.prebuild_prefix)
    }

    pub fn image_volume_name(&self, image: &str) -> String {
        format!("{}{image}", self.config.image_prefix)
    }

    /// Block device path of a logical volume.
    pub fn device_path(&self, name: &str) -> PathBuf {
        PathBuf::from(format!("/dev/{}/{name}", self.config.volume_group))
    }

    /// Overlay file used when the pool is unavailable.
    pub fn overlay_path(&self, id: &SandboxId) -> PathBuf {
        self.config.overlay_dir.join(format!("{id}.ext4"))
    }

    fn qualified(&self, name: &str) -> String {
        format!("{}/{name}", self.config.volume_group)
    }

    /// Whether the thin pool exists.
    pub async fn is_available(&self) -> bool {
        let pool = self.qualified(&self.config.thin_pool);
        self.lv_exists(&pool).await
    }

    pub async fn volume_exists(&self, name: &str) -> bool {
        self.lv_exists(&self.qualified(name)).await
    }

    pub async fn has_prebuild(&self, workspace_id: &str) -> bool {
        self.volume_exists(&self.prebuild_volume_name(workspace_id))
            .await
    }

    async fn lv_exists(&self, qualified: &str) -> bool {
        let lvs = self.config.lvs.to_string_lossy();
        matches!(self.runner.run(&lvs, &[qualified]).await, Ok(out) if out.success())
    }

    async fn lock_for(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(name.to_string()).or_default())
    }

    /// Pick the snapshot origin: workspace prebuild, then the requested base
    /// image, then the default image, then the base volume.
    pub async fn select_source(&self, source: &VolumeSource) -> String {
        if let Some(workspace_id) = &source.workspace_id {
            let prebuild = self.prebuild_volume_name(workspace_id);
            if self.volume_exists(&prebuild).await {
                return prebuild;
            }
        }
        if let Some(image) = &source.base_image {
            let volume = self.image_volume_name(image);
            if self.volume_exists(&volume).await {
                return volume;
            }
        }
        let default = self.image_volume_name(&self.config.default_image);
        if self.volume_exists(&default).await {
            return default;
        }
        self.config.base_volume.clone()
    }

    /// Snapshot a root volume for `id` and return its device path.
    ///
    /// # Errors
    /// Returns [`CoreError::StorageUnavailable`] when the thin pool is missing.
    pub async fn create_sandbox_volume(
        &self,
        id: &SandboxId,
        source: &VolumeSource,
    ) -> Result<PathBuf> {
        if !self.is_available().await {
            return Err(CoreError::StorageUnavailable(
                self.qualified(&self.config.thin_pool),
            ));
        }

        let name = self.sandbox_volume_name(id);
        let origin = self.select_source(source).await;
        let lock = self.lock_for(&name).await;
        let _guard = lock.lock().await;

        let start = std::time::Instant::now();
        self.snapshot(&origin, &name).await?;
        tracing::info!(
            sandbox_id = %id,
            volume = %name,
            origin = %origin,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Sandbox volume created"
        );
        Ok(self.device_path(&name))
    }

    /// Remove the sandbox volume. Never fails.
    pub async fn delete_sandbox_volume(&self, id: &SandboxId) {
        let name = self.sandbox_volume_name(id);
        let lock = self.lock_for(&name).await;
        let _guard = lock.lock().await;
        self.remove(&name).await;
    }

    /// Snapshot a running sandbox's volume as the workspace's prebuild,
    /// replacing any existing one.
    pub async fn create_prebuild(&self, workspace_id: &str, sandbox_id: &SandboxId) -> Result<PathBuf> {
        if !self.is_available().await {
            return Err(CoreError::StorageUnavailable(
                self.qualified(&self.config.thin_pool),
            ));
        }

        let name = self.prebuild_volume_name(workspace_id);
        let origin = self.sandbox_volume_name(sandbox_id);
        let lock = self.lock_for(&name).await;
        let _guard = lock.lock().await;

        if self.volume_exists(&name).await {
            tracing::debug!(workspace_id, volume = %name, "Replacing existing prebuild");
            self.remove(&name).await;
        }
        self.snapshot(&origin, &name).await?;
        tracing::info!(workspace_id, sandbox_id = %sandbox_id, volume = %name, "Prebuild created");
        Ok(self.device_path(&name))
    }

    /// Remove the workspace prebuild if it exists.
    pub async fn delete_prebuild(&self, workspace_id: &str) {
        let name = self.prebuild_volume_name(workspace_id);
        let lock = self.lock_for(&name).await;
        let _guard = lock.lock().await;
        if self.volume_exists(&name).await {
            self.remove(&name).await;
        }
    }

    /// Names of all sandbox volumes in the group.
    pub async fn list_sandbox_volumes(&self) -> Result<Vec<String>> {
        let lvs = self.config.lvs.to_string_lossy();
        let out = self
            .runner
            .run_checked(&lvs, &["--noheadings", "-o", "lv_name", &self.config.volume_group])
            .await?;
        Ok(out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|n| n.starts_with(&self.config.sandbox_prefix))
            .map(String::from)
            .collect())
    }

    async fn snapshot(&self, origin: &str, name: &str) -> Result<()> {
        let lvcreate = self.config.lvcreate.to_string_lossy();
        let qualified_origin = self.qualified(origin);
        self.runner
            .run_checked(&lvcreate, &["-s", "-kn", "-n", name, &qualified_origin])
            .await?;
        Ok(())
    }

    async fn remove(&self, name: &str) {
        let lvremove = self.config.lvremove.to_string_lossy();
        let qualified = self.qualified(name);
        match self.runner.run(&lvremove, &["-f", &qualified]).await {
            Ok(out) if out.success() => tracing::debug!(volume = %qualified, "Volume removed"),
            Ok(out) => tracing::debug!(volume = %qualified, stderr = %out.stderr.trim(), "Volume not removed"),
            Err(e) => tracing::warn!(volume = %qualified, error = %e, "Failed to run lvremove"),
        }
    }
}
