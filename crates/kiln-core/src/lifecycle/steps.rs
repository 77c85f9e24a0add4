//! Steps of the sandbox provisioning saga.
//!
//! Each step reads what earlier steps stored on [`BuildContext`] and records
//! what it acquired, so its compensation knows exactly what to undo.

use super::Services;
use crate::error::{CoreError, Result};
use crate::guest::{sh_quote, GuestFile, GuestManifest, GuestTarget, WritePhase, DEV_HOME};
use crate::network::NetworkAllocation;
use crate::saga::SagaStep;
use crate::sandbox::{CreateSandboxRequest, Sandbox, SandboxId, SandboxRuntime, SandboxStatus, SandboxUrls};
use crate::volume::{RootDisk, VolumeSource};
use crate::workspace::{PrebuildStatus, RepoConfig, Workspace};
use async_trait::async_trait;
use kiln_vm::VmBuilder;
use std::sync::Arc;

/// State threaded through one provisioning saga.
pub struct BuildContext {
    pub(crate) services: Arc<Services>,
    pub(crate) id: SandboxId,
    pub(crate) request: CreateSandboxRequest,
    pub(crate) workspace: Option<Workspace>,
    pub(crate) network: Option<NetworkAllocation>,
    pub(crate) root_disk: Option<RootDisk>,
    pub(crate) used_prebuild: bool,
    pub(crate) sandbox: Option<Sandbox>,
    pub(crate) pid: Option<u32>,
    pub(crate) manifest: Option<GuestManifest>,
    pub(crate) files: Vec<GuestFile>,
    pub(crate) urls: Option<SandboxUrls>,
}

impl BuildContext {
    pub(crate) fn new(services: Arc<Services>, id: SandboxId, request: CreateSandboxRequest) -> Self {
        Self {
            services,
            id,
            request,
            workspace: None,
            network: None,
            root_disk: None,
            used_prebuild: false,
            sandbox: None,
            pid: None,
            manifest: None,
            files: Vec::new(),
            urls: None,
        }
    }

    fn network(&self) -> Result<&NetworkAllocation> {
        self.network.as_ref().ok_or_else(|| missing("network allocation"))
    }

    fn root_disk(&self) -> Result<&RootDisk> {
        self.root_disk.as_ref().ok_or_else(|| missing("root disk"))
    }

    fn sandbox_mut(&mut self) -> Result<&mut Sandbox> {
        self.sandbox.as_mut().ok_or_else(|| missing("sandbox record"))
    }

    fn target(&self) -> Result<GuestTarget> {
        Ok(GuestTarget {
            sandbox_id: self.id,
            root_disk: self.root_disk()?.clone(),
            ip_address: self.network()?.ip_address.clone(),
        })
    }
}

fn missing(what: &str) -> CoreError {
    CoreError::InvalidState {
        expected: format!("{what} from an earlier step"),
        actual: "none".into(),
    }
}

/// Guest directory a repository is cloned into.
pub(crate) fn repo_dir(clone_path: &str) -> String {
    if clone_path.starts_with("/workspace") {
        format!("{DEV_HOME}{clone_path}")
    } else {
        format!("{DEV_HOME}/workspace/{}", clone_path.trim_start_matches('/'))
    }
}

// ============================================================================
// Resources
// ============================================================================

pub struct LoadWorkspace;

#[async_trait]
impl SagaStep<BuildContext> for LoadWorkspace {
    fn name(&self) -> &'static str {
        "load_workspace"
    }

    async fn execute(&self, ctx: &mut BuildContext) -> Result<()> {
        if let Some(workspace_id) = &ctx.request.workspace_id {
            let workspace = ctx
                .services
                .catalog
                .get(workspace_id)
                .await?
                .ok_or_else(|| CoreError::not_found("workspace", workspace_id))?;
            ctx.workspace = Some(workspace);
        }
        Ok(())
    }
}

pub struct AllocateNetwork;

#[async_trait]
impl SagaStep<BuildContext> for AllocateNetwork {
    fn name(&self) -> &'static str {
        "allocate_network"
    }

    async fn execute(&self, ctx: &mut BuildContext) -> Result<()> {
        ctx.network = Some(ctx.services.network.allocate(&ctx.id).await?);
        Ok(())
    }

    async fn compensate(&self, ctx: &mut BuildContext) {
        if let Some(network) = &ctx.network {
            ctx.services.network.release(&network.ip_address).await;
        }
    }
}

pub struct CreateVolume;

impl CreateVolume {
    async fn copy_overlay(ctx: &BuildContext) -> Result<RootDisk> {
        let storage = ctx.services.volumes.config();
        let overlay = ctx.services.volumes.overlay_path(&ctx.id);
        tokio::fs::create_dir_all(&storage.overlay_dir).await?;
        if let Err(e) = tokio::fs::copy(&storage.base_rootfs, &overlay).await {
            if let Err(cleanup) = tokio::fs::remove_file(&overlay).await {
                tracing::debug!(
                    sandbox_id = %ctx.id,
                    path = %overlay.display(),
                    error = %cleanup,
                    "Partial overlay not removed"
                );
            }
            return Err(e.into());
        }
        Ok(RootDisk::Overlay(overlay))
    }
}

#[async_trait]
impl SagaStep<BuildContext> for CreateVolume {
    fn name(&self) -> &'static str {
        "create_volume"
    }

    async fn execute(&self, ctx: &mut BuildContext) -> Result<()> {
        let volumes = &ctx.services.volumes;
        let prebuild_ready = match &ctx.workspace {
            Some(ws) if ws.prebuild_status() == PrebuildStatus::Ready => {
                volumes.has_prebuild(&ws.id).await
            }
            _ => false,
        };
        let source = VolumeSource {
            workspace_id: prebuild_ready
                .then(|| ctx.workspace.as_ref().map(|w| w.id.clone()))
                .flatten(),
            base_image: ctx
                .request
                .base_image
                .clone()
                .or_else(|| ctx.workspace.as_ref().map(|w| w.config.base_image.clone())),
        };

        let disk = match volumes.create_sandbox_volume(&ctx.id, &source).await {
            Ok(path) => {
                ctx.used_prebuild = prebuild_ready;
                RootDisk::Volume(path)
            }
            Err(CoreError::StorageUnavailable(pool)) => {
                tracing::warn!(sandbox_id = %ctx.id, pool = %pool, "Thin pool unavailable, copying base rootfs");
                Self::copy_overlay(ctx).await?
            }
            Err(e) => return Err(e),
        };
        tracing::debug!(
            sandbox_id = %ctx.id,
            disk = %disk.path().display(),
            used_prebuild = ctx.used_prebuild,
            "Root disk ready"
        );
        ctx.root_disk = Some(disk);
        Ok(())
    }

    async fn compensate(&self, ctx: &mut BuildContext) {
        match &ctx.root_disk {
            Some(RootDisk::Volume(_)) => ctx.services.volumes.delete_sandbox_volume(&ctx.id).await,
            Some(RootDisk::Overlay(path)) => {
                if let Err(e) = tokio::fs::remove_file(path).await {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to remove overlay");
                }
            }
            None => {}
        }
    }
}

/// Persist the record in `creating` state. Marking it `error` on failure is
/// left to the controller so it happens after every compensation.
pub struct InitializeRecord;

#[async_trait]
impl SagaStep<BuildContext> for InitializeRecord {
    fn name(&self) -> &'static str {
        "initialize_record"
    }

    async fn execute(&self, ctx: &mut BuildContext) -> Result<()> {
        let defaults = ctx.services.config.defaults;
        let ws = ctx.workspace.as_ref().map(|w| &w.config);
        let vcpus = ctx
            .request
            .vcpus
            .or(ws.map(|c| c.vcpus))
            .unwrap_or(defaults.vcpus);
        let memory_mb = ctx
            .request
            .memory_mb
            .or(ws.map(|c| c.memory_mb))
            .unwrap_or(defaults.memory_mb);

        let network = ctx.network()?;
        let runtime = SandboxRuntime {
            ip_address: Some(network.ip_address.clone()),
            mac_address: Some(network.mac_address.clone()),
            vcpus,
            memory_mb,
            ..Default::default()
        };
        let sandbox = Sandbox::creating(ctx.id, ctx.request.workspace_id.clone(), runtime);
        ctx.services.repository.create(&sandbox).await?;
        tracing::info!(sandbox_id = %ctx.id, vcpus, memory_mb, "Sandbox initialised");
        ctx.sandbox = Some(sandbox);
        Ok(())
    }
}

pub struct CreateTap;

#[async_trait]
impl SagaStep<BuildContext> for CreateTap {
    fn name(&self) -> &'static str {
        "create_tap"
    }

    async fn execute(&self, ctx: &mut BuildContext) -> Result<()> {
        let tap = ctx.network()?.tap_device.clone();
        ctx.services.taps.create(&tap).await
    }

    /// Also runs when creation failed halfway, e.g. after `tuntap add`.
    async fn compensate(&self, ctx: &mut BuildContext) {
        if let Some(network) = &ctx.network {
            ctx.services.taps.delete(&network.tap_device).await;
        }
    }
}

pub struct InjectConfig;

#[async_trait]
impl SagaStep<BuildContext> for InjectConfig {
    fn name(&self) -> &'static str {
        "inject_config"
    }

    async fn execute(&self, ctx: &mut BuildContext) -> Result<()> {
        let services = Arc::clone(&ctx.services);
        let manifest = GuestManifest::resolve(
            ctx.id,
            ctx.workspace.clone(),
            ctx.network()?.clone(),
            &services.config,
            services.cipher.as_ref(),
            services.catalog.as_ref(),
        )
        .await?;
        let files = manifest.render()?;
        let target = ctx.target()?;

        for writer in services
            .writers
            .iter()
            .filter(|w| w.phase() == WritePhase::BeforeBoot)
        {
            writer.write(&target, &files).await?;
        }

        ctx.manifest = Some(manifest);
        ctx.files = files;
        Ok(())
    }
}

// ============================================================================
// Hypervisor
// ============================================================================

pub struct LaunchHypervisor;

#[async_trait]
impl SagaStep<BuildContext> for LaunchHypervisor {
    fn name(&self) -> &'static str {
        "launch_hypervisor"
    }

    async fn execute(&self, ctx: &mut BuildContext) -> Result<()> {
        let pid = ctx.services.hypervisor.launch(&ctx.id).await?;
        tracing::debug!(sandbox_id = %ctx.id, pid, "Hypervisor launched");
        ctx.pid = Some(pid);
        Ok(())
    }

    async fn compensate(&self, ctx: &mut BuildContext) {
        let grace = ctx.services.config.timing.rollback_kill_grace;
        ctx.services.hypervisor.terminate(&ctx.id, ctx.pid, grace).await;
    }
}

pub struct ConfigureVm;

#[async_trait]
impl SagaStep<BuildContext> for ConfigureVm {
    fn name(&self) -> &'static str {
        "configure_vm"
    }

    async fn execute(&self, ctx: &mut BuildContext) -> Result<()> {
        let paths = &ctx.services.config.paths;
        let cpu_template = match &paths.cpu_template {
            Some(path) if tokio::fs::try_exists(path).await.unwrap_or(false) => Some(path.clone()),
            _ => None,
        };
        let (vcpus, memory_mb) = match &ctx.sandbox {
            Some(s) => (s.runtime.vcpus, s.runtime.memory_mb),
            None => return Err(missing("sandbox record")),
        };
        let network = ctx.network()?;

        let machine = VmBuilder::new()
            .vcpus(vcpus)
            .memory_mib(memory_mb)
            .kernel(paths.kernel_path.clone())
            .rootfs(ctx.root_disk()?.path().clone())
            .with_network(&network.tap_device, &network.mac_address)
            .cpu_template(cpu_template)
            .build_config();
        ctx.services.hypervisor.configure(&ctx.id, &machine).await
    }
}

pub struct Boot;

#[async_trait]
impl SagaStep<BuildContext> for Boot {
    fn name(&self) -> &'static str {
        "boot"
    }

    async fn execute(&self, ctx: &mut BuildContext) -> Result<()> {
        ctx.services.hypervisor.boot(&ctx.id).await
    }
}

// ============================================================================
// Guest
// ============================================================================

pub struct WaitForAgentAndClone;

impl WaitForAgentAndClone {
    async fn clone_repo(ctx: &BuildContext, host: &str, repo: &RepoConfig, url: &str) -> Result<()> {
        let agent = &ctx.services.agent;
        let timing = &ctx.services.config.timing;
        let dir = sh_quote(&repo_dir(&repo.clone_path));
        tracing::info!(sandbox_id = %ctx.id, repo = repo.display_name(), branch = %repo.branch, "Cloning repository");

        agent
            .exec(host, &format!("rm -rf {dir}"), timing.clone_timeout)
            .await?;
        let result = agent
            .exec(
                host,
                &format!(
                    "git clone --depth 1 -b {} {} {dir}",
                    sh_quote(&repo.branch),
                    sh_quote(url)
                ),
                timing.clone_timeout,
            )
            .await?;
        if !result.success() {
            tracing::error!(sandbox_id = %ctx.id, repo = repo.display_name(), stderr = %result.stderr.trim(), "Git clone failed");
            return Err(CoreError::CloneFailure {
                repo: repo.display_name().to_string(),
                message: result.stderr.trim().to_string(),
            });
        }

        agent
            .exec(host, &format!("chown -R dev:dev {dir}"), timing.clone_timeout)
            .await?;
        let safe = format!("git config --global --add safe.directory {dir}");
        agent
            .exec(host, &format!("su - dev -c {}", sh_quote(&safe)), timing.clone_timeout)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl SagaStep<BuildContext> for WaitForAgentAndClone {
    fn name(&self) -> &'static str {
        "wait_for_agent_and_clone"
    }

    async fn execute(&self, ctx: &mut BuildContext) -> Result<()> {
        let host = ctx.network()?.ip_address.clone();
        let wait = ctx.services.config.timing.agent_wait;
        let repos: Vec<RepoConfig> = ctx
            .manifest
            .as_ref()
            .map(|m| m.repos().to_vec())
            .unwrap_or_default();
        let needs_clone = !ctx.used_prebuild && !repos.is_empty();

        if !ctx.services.agent.wait_for_agent(&host, wait).await {
            if needs_clone {
                return Err(CoreError::AgentUnreachable {
                    host,
                    timeout: wait.timeout,
                });
            }
            tracing::warn!(sandbox_id = %ctx.id, host = %host, "Agent did not become ready");
            return Ok(());
        }

        let target = ctx.target()?;
        for writer in ctx
            .services
            .writers
            .iter()
            .filter(|w| w.phase() == WritePhase::AgentReady)
        {
            writer.write(&target, &ctx.files).await?;
        }

        if needs_clone {
            for repo in &repos {
                let url = ctx
                    .manifest
                    .as_ref()
                    .map(|m| m.clone_url(repo))
                    .ok_or_else(|| missing("guest manifest"))?;
                Self::clone_repo(ctx, &host, repo, &url).await?;
            }
            tracing::info!(sandbox_id = %ctx.id, repos = repos.len(), "Repositories cloned");
        }
        Ok(())
    }
}

// ============================================================================
// Routing and completion
// ============================================================================

pub struct RegisterRoutes;

#[async_trait]
impl SagaStep<BuildContext> for RegisterRoutes {
    fn name(&self) -> &'static str {
        "register_routes"
    }

    async fn execute(&self, ctx: &mut BuildContext) -> Result<()> {
        let ip = ctx.network()?.ip_address.clone();
        let ports = ctx.services.config.ports;
        ctx.urls = Some(ctx.services.proxy.register_routes(&ctx.id, &ip, &ports).await?);
        Ok(())
    }

    async fn compensate(&self, ctx: &mut BuildContext) {
        if let Err(e) = ctx.services.proxy.remove_routes(&ctx.id).await {
            tracing::warn!(sandbox_id = %ctx.id, error = %e, "Failed to remove proxy routes");
        }
    }

    fn compensate_always(&self) -> bool {
        true
    }
}

pub struct Finalize;

#[async_trait]
impl SagaStep<BuildContext> for Finalize {
    fn name(&self) -> &'static str {
        "finalize"
    }

    async fn execute(&self, ctx: &mut BuildContext) -> Result<()> {
        let urls = ctx.urls.clone().ok_or_else(|| missing("route urls"))?;
        let pid = ctx.pid.ok_or_else(|| missing("hypervisor pid"))?;
        let repository = Arc::clone(&ctx.services.repository);

        let sandbox = ctx.sandbox_mut()?;
        sandbox.status = SandboxStatus::Running;
        sandbox.runtime.pid = Some(pid);
        sandbox.runtime.urls = Some(urls);
        sandbox.touch();
        repository.update(sandbox).await?;

        tracing::info!(sandbox_id = %ctx.id, pid, "Sandbox running");
        Ok(())
    }
}

/// Stand-in pid for a synthetic sandbox, stable for its id.
pub(crate) fn synthetic_pid(id: &SandboxId) -> u32 {
    (id.as_uuid().as_u128() % 100_000) as u32 + 1
}

/// Report the sandbox running right after the record exists.
pub struct FinalizeSynthetic;

#[async_trait]
impl SagaStep<BuildContext> for FinalizeSynthetic {
    fn name(&self) -> &'static str {
        "finalize_synthetic"
    }

    async fn execute(&self, ctx: &mut BuildContext) -> Result<()> {
        let urls = ctx.services.proxy.urls(&ctx.id, &ctx.network()?.ip_address);
        let repository = Arc::clone(&ctx.services.repository);

        let pid = synthetic_pid(&ctx.id);

        let sandbox = ctx.sandbox_mut()?;
        sandbox.status = SandboxStatus::Running;
        sandbox.runtime.pid = Some(pid);
        sandbox.runtime.urls = Some(urls);
        sandbox.touch();
        repository.update(sandbox).await?;

        tracing::info!(sandbox_id = %ctx.id, pid, "Synthetic sandbox running");
        Ok(())
    }
}
