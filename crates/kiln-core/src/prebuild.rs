//! Golden root-volume snapshots per workspace.
//!
//! A prebuild boots a throwaway sandbox from the base image, lets the saga
//! clone the workspace repositories, runs the init commands, then snapshots
//! the sandbox volume as `prebuild-{workspace}` and destroys the sandbox.

use crate::error::{CoreError, Result};
use crate::guest::{sh_quote, DEV_HOME};
use crate::lifecycle::LifecycleController;
use crate::sandbox::{CreateSandboxRequest, SandboxId};
use crate::workspace::{PrebuildInfo, PrebuildStatus, Workspace};
use chrono::Utc;
use std::sync::Arc;

/// Builds and deletes workspace prebuilds through the lifecycle controller.
pub struct PrebuildRunner {
    controller: Arc<LifecycleController>,
}

impl PrebuildRunner {
    pub fn new(controller: Arc<LifecycleController>) -> Self {
        Self { controller }
    }

    async fn workspace(&self, workspace_id: &str) -> Result<Workspace> {
        self.controller
            .services()
            .catalog
            .get(workspace_id)
            .await?
            .ok_or_else(|| CoreError::not_found("workspace", workspace_id))
    }

    async fn set_status(&self, workspace: &Workspace, status: PrebuildStatus, latest_id: Option<String>) {
        let prebuild = PrebuildInfo {
            status,
            latest_id: latest_id.or_else(|| workspace.config.prebuild.as_ref().and_then(|p| p.latest_id.clone())),
            built_at: (status == PrebuildStatus::Ready).then(Utc::now),
        };
        if let Err(e) = self
            .controller
            .services()
            .catalog
            .set_prebuild(&workspace.id, prebuild)
            .await
        {
            tracing::warn!(workspace_id = %workspace.id, ?status, error = %e, "Failed to record prebuild status");
        }
    }

    /// Build the prebuild of `workspace_id`, replacing any existing one.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown workspaces, `InvalidState` when a build is
    /// already running, otherwise the error that failed the build. The
    /// workspace is left `failed` and the build sandbox is destroyed.
    pub async fn run(&self, workspace_id: &str) -> Result<()> {
        let workspace = self.claim(workspace_id).await?;
        self.run_claimed(workspace).await
    }

    /// Claim the workspace, then build on its own task. Only the claim is
    /// reported; build failures are logged and recorded as `failed`.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown workspaces, `InvalidState` when a build is
    /// already running.
    pub async fn start(self: &Arc<Self>, workspace_id: &str) -> Result<()> {
        let workspace = self.claim(workspace_id).await?;
        let runner = Arc::clone(self);
        tokio::spawn(async move {
            let workspace_id = workspace.id.clone();
            if let Err(e) = runner.run_claimed(workspace).await {
                tracing::error!(workspace_id, error = %e, "Background prebuild failed");
            }
        });
        Ok(())
    }

    async fn claim(&self, workspace_id: &str) -> Result<Workspace> {
        self.controller
            .services()
            .catalog
            .begin_prebuild(workspace_id)
            .await
    }

    async fn run_claimed(&self, workspace: Workspace) -> Result<()> {
        let workspace_id = workspace.id.as_str();
        tracing::info!(workspace_id, name = %workspace.name, "Starting prebuild");
        let start = std::time::Instant::now();

        let id = SandboxId::new();
        match self.build(&workspace, id).await {
            Ok(()) => {
                self.set_status(&workspace, PrebuildStatus::Ready, Some(id.to_string()))
                    .await;
                tracing::info!(
                    workspace_id,
                    sandbox_id = %id,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Prebuild completed"
                );
                Ok(())
            }
            Err(e) => {
                tracing::error!(workspace_id, sandbox_id = %id, error = %e, "Prebuild failed");
                if let Err(cleanup) = self.controller.destroy(&id).await {
                    tracing::warn!(sandbox_id = %id, error = %cleanup, "Failed to clean up prebuild sandbox");
                }
                self.set_status(&workspace, PrebuildStatus::Failed, None).await;
                Err(e)
            }
        }
    }

    async fn build(&self, workspace: &Workspace, id: SandboxId) -> Result<()> {
        let services = self.controller.services();
        let sandbox = self
            .controller
            .create_with_id(id, CreateSandboxRequest::for_workspace(workspace.id.clone()))
            .await?;
        tracing::info!(sandbox_id = %id, ip = ?sandbox.runtime.ip_address, "Prebuild sandbox spawned");

        if !self.controller.wait_for_agent(&id).await? {
            return Err(CoreError::AgentUnreachable {
                host: sandbox.runtime.ip_address.unwrap_or_default(),
                timeout: services.config.timing.agent_wait.timeout,
            });
        }

        self.run_init_commands(workspace, &id).await?;
        self.controller
            .exec(&id, "sync", services.config.timing.init_command_timeout)
            .await?;

        services.volumes.create_prebuild(&workspace.id, &id).await?;
        self.controller.destroy(&id).await
    }

    async fn run_init_commands(&self, workspace: &Workspace, id: &SandboxId) -> Result<()> {
        let commands = &workspace.config.init_commands;
        if commands.is_empty() {
            tracing::info!(workspace_id = %workspace.id, "No init commands to run");
            return Ok(());
        }
        let timeout = self.controller.services().config.timing.init_command_timeout;
        let dir = format!("{DEV_HOME}/workspace");

        for command in commands {
            tracing::info!(workspace_id = %workspace.id, command = %command, "Running init command");
            let result = self
                .controller
                .exec(id, &format!("cd {dir} && su dev -c {}", sh_quote(command)), timeout)
                .await?;
            if !result.success() {
                return Err(CoreError::InitCommand {
                    command: command.clone(),
                    exit_code: result.exit_code,
                    stderr: result.stderr.trim().to_string(),
                });
            }
            tracing::debug!(command = %command, stdout = %result.stdout, "Init command finished");
        }

        self.controller
            .exec(id, &format!("chown -R dev:dev {dir}"), timeout)
            .await?;
        Ok(())
    }

    /// Remove the prebuild volume and reset the status to `none`.
    pub async fn delete(&self, workspace_id: &str) -> Result<()> {
        let workspace = self.workspace(workspace_id).await?;
        self.controller
            .services()
            .volumes
            .delete_prebuild(workspace_id)
            .await;
        self.set_status(&workspace, PrebuildStatus::None, None).await;
        tracing::info!(workspace_id, "Prebuild deleted");
        Ok(())
    }

    pub async fn has_prebuild(&self, workspace_id: &str) -> bool {
        self.controller.services().volumes.has_prebuild(workspace_id).await
    }
}
