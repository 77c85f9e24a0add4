//! VM lifecycle controller.
//!
//! Creating a sandbox runs a [`Saga`] of explicit steps:
//!
//! ```text
//! load_workspace → allocate_network → create_volume → initialize_record
//!   → create_tap → inject_config → launch_hypervisor → configure_vm → boot
//!   → wait_for_agent_and_clone → register_routes → finalize
//! ```
//!
//! On the first failure every step that ran is compensated in reverse and
//! the record is marked `error`. A sandbox is therefore only ever observed
//! as `creating`, `running` or `error`.
//!
//! In [`RuntimeMode::Synthetic`] everything after `initialize_record` is
//! replaced by a step that reports the sandbox running straight away.

mod steps;

use crate::agent::{AgentClient, ExecResult, GuestAgent};
use crate::command::{CommandRunner, DryRunRunner, SystemRunner};
use crate::config::{CoreConfig, RuntimeMode};
use crate::error::{CoreError, Result};
use crate::guest::{GuestConfigWriter, MountWriter};
use crate::hypervisor::{FirecrackerHypervisor, Hypervisor};
use crate::network::{tap_name, NetworkAllocator, TapManager};
use crate::proxy::{CaddyRegistrar, OfflineRegistrar, RouteRegistrar};
use crate::repository::SandboxRepository;
use crate::saga::Saga;
use crate::sandbox::{CreateSandboxRequest, Sandbox, SandboxId, SandboxStatus};
use crate::secrets::SecretCipher;
use crate::volume::VolumeManager;
use crate::workspace::WorkspaceCatalog;
use std::sync::Arc;
use std::time::Duration;
use steps::*;

/// Collaborators that differ between production, synthetic mode and tests.
pub struct Collaborators {
    pub hypervisor: Arc<dyn Hypervisor>,
    pub agent: Arc<dyn GuestAgent>,
    pub proxy: Arc<dyn RouteRegistrar>,
    pub repository: Arc<dyn SandboxRepository>,
    pub catalog: Arc<dyn WorkspaceCatalog>,
    pub cipher: Arc<dyn SecretCipher>,
}

/// Everything a provisioning saga touches.
pub struct Services {
    pub config: CoreConfig,
    pub runner: Arc<dyn CommandRunner>,
    pub network: NetworkAllocator,
    pub taps: TapManager,
    pub volumes: VolumeManager,
    pub hypervisor: Arc<dyn Hypervisor>,
    pub agent: Arc<dyn GuestAgent>,
    pub proxy: Arc<dyn RouteRegistrar>,
    pub repository: Arc<dyn SandboxRepository>,
    pub catalog: Arc<dyn WorkspaceCatalog>,
    pub cipher: Arc<dyn SecretCipher>,
    pub writers: Vec<Arc<dyn GuestConfigWriter>>,
}

impl Services {
    /// Wire the resource managers around `runner`. Guest files are written
    /// through a loopback mount unless other writers are installed.
    pub fn new(config: CoreConfig, runner: Arc<dyn CommandRunner>, with: Collaborators) -> Self {
        let mount_writer = MountWriter::new(Arc::clone(&runner), config.paths.mount_root.clone());
        Self {
            network: NetworkAllocator::new(config.network.clone()),
            taps: TapManager::new(Arc::clone(&runner), config.network.bridge_name.clone()),
            volumes: VolumeManager::new(config.storage.clone(), Arc::clone(&runner)),
            writers: vec![Arc::new(mount_writer)],
            hypervisor: with.hypervisor,
            agent: with.agent,
            proxy: with.proxy,
            repository: with.repository,
            catalog: with.catalog,
            cipher: with.cipher,
            runner,
            config,
        }
    }

    /// Real host tools, Firecracker, Caddy and the HTTP guest agent. In
    /// synthetic mode host commands are only logged and the proxy is left
    /// alone.
    pub fn from_config(
        config: CoreConfig,
        repository: Arc<dyn SandboxRepository>,
        catalog: Arc<dyn WorkspaceCatalog>,
        cipher: Arc<dyn SecretCipher>,
    ) -> Self {
        let (runner, proxy): (Arc<dyn CommandRunner>, Arc<dyn RouteRegistrar>) = match config.mode {
            RuntimeMode::Production => (
                Arc::new(SystemRunner),
                Arc::new(CaddyRegistrar::new(config.proxy.clone())),
            ),
            RuntimeMode::Synthetic => (
                Arc::new(DryRunRunner),
                Arc::new(OfflineRegistrar::new(config.proxy.domain_suffix.clone())),
            ),
        };
        let collaborators = Collaborators {
            hypervisor: Arc::new(FirecrackerHypervisor::new(&config.paths, &config.timing)),
            agent: Arc::new(AgentClient::new(config.ports.agent)),
            proxy,
            repository,
            catalog,
            cipher,
        };
        Self::new(config, runner, collaborators)
    }

    /// Replace the guest config writers, e.g. to push through the agent.
    pub fn with_writers(mut self, writers: Vec<Arc<dyn GuestConfigWriter>>) -> Self {
        self.writers = writers;
        self
    }
}

/// Creates, inspects and destroys sandboxes.
///
/// # Thread Safety
///
/// The controller is shared behind an `Arc`. Concurrent builds only meet in
/// the network allocator, the proxy registrar and the volume manager, each of
/// which serializes its own critical section.
pub struct LifecycleController {
    services: Arc<Services>,
}

impl LifecycleController {
    pub fn new(services: Services) -> Self {
        tracing::info!(mode = ?services.config.mode, "Creating lifecycle controller");
        Self {
            services: Arc::new(services),
        }
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    fn saga(&self) -> Saga<BuildContext> {
        let saga = Saga::new("create_sandbox")
            .step(LoadWorkspace)
            .step(AllocateNetwork)
            .step(CreateVolume)
            .step(InitializeRecord);

        match self.services.config.mode {
            RuntimeMode::Synthetic => saga.step(FinalizeSynthetic),
            RuntimeMode::Production => saga
                .step(CreateTap)
                .step(InjectConfig)
                .step(LaunchHypervisor)
                .step(ConfigureVm)
                .step(Boot)
                .step(WaitForAgentAndClone)
                .step(RegisterRoutes)
                .step(Finalize),
        }
    }

    /// Provision a new sandbox and return it once it is running.
    ///
    /// # Errors
    ///
    /// Returns the error of the failing step after every acquired resource
    /// was released. If the record had been created it is left in `error`
    /// state with the step name and message.
    pub async fn create(&self, request: CreateSandboxRequest) -> Result<Sandbox> {
        self.create_with_id(SandboxId::new(), request).await
    }

    /// Like [`create`](Self::create) with a caller-chosen id.
    pub async fn create_with_id(&self, id: SandboxId, request: CreateSandboxRequest) -> Result<Sandbox> {
        let start = std::time::Instant::now();
        tracing::info!(sandbox_id = %id, workspace_id = ?request.workspace_id, "Creating sandbox");

        let mut ctx = BuildContext::new(Arc::clone(&self.services), id, request);
        match self.saga().run(&mut ctx).await {
            Ok(()) => {
                tracing::info!(
                    sandbox_id = %id,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Sandbox created"
                );
                ctx.sandbox.take().ok_or_else(|| CoreError::InvalidState {
                    expected: "sandbox record".into(),
                    actual: "none".into(),
                })
            }
            Err(failure) => {
                if let Some(mut sandbox) = ctx.sandbox.take() {
                    sandbox.status = SandboxStatus::Error;
                    sandbox.runtime.pid = None;
                    sandbox.runtime.error = Some(format!("{}: {}", failure.step, failure.error));
                    sandbox.touch();
                    if let Err(e) = self.services.repository.update(&sandbox).await {
                        tracing::warn!(sandbox_id = %id, error = %e, "Failed to mark sandbox as failed");
                    }
                }
                tracing::error!(
                    sandbox_id = %id,
                    step = failure.step,
                    error = %failure.error,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Sandbox creation failed"
                );
                Err(failure.error)
            }
        }
    }

    /// Tear a sandbox down and delete its record.
    ///
    /// Every cleanup step is best-effort, so destroying a half-built or
    /// already destroyed sandbox succeeds.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` while the sandbox is still being created.
    pub async fn destroy(&self, id: &SandboxId) -> Result<()> {
        let services = &self.services;
        let Some(sandbox) = services.repository.get(id).await? else {
            tracing::debug!(sandbox_id = %id, "Destroy of unknown sandbox ignored");
            return Ok(());
        };
        if sandbox.status == SandboxStatus::Creating {
            return Err(CoreError::InvalidState {
                expected: "running, stopped or error".into(),
                actual: sandbox.status.to_string(),
            });
        }
        tracing::info!(sandbox_id = %id, status = %sandbox.status, "Destroying sandbox");

        // Synthetic pids name no real process
        if services.config.mode == RuntimeMode::Production {
            services
                .hypervisor
                .terminate(id, sandbox.runtime.pid, services.config.timing.destroy_kill_grace)
                .await;
        }

        if services.volumes.is_available().await {
            services.volumes.delete_sandbox_volume(id).await;
        }
        let overlay = services.volumes.overlay_path(id);
        if tokio::fs::try_exists(&overlay).await.unwrap_or(false) {
            if let Err(e) = tokio::fs::remove_file(&overlay).await {
                tracing::warn!(sandbox_id = %id, path = %overlay.display(), error = %e, "Failed to remove overlay");
            }
        }

        services.taps.delete(&tap_name(id)).await;
        if let Some(ip) = &sandbox.runtime.ip_address {
            services.network.release(ip).await;
        }
        if let Err(e) = services.proxy.remove_routes(id).await {
            tracing::warn!(sandbox_id = %id, error = %e, "Failed to remove proxy routes");
        }
        if let Err(e) = services.repository.delete(id).await {
            tracing::warn!(sandbox_id = %id, error = %e, "Failed to delete sandbox record");
        }

        tracing::info!(sandbox_id = %id, "Sandbox destroyed");
        Ok(())
    }

    pub async fn get(&self, id: &SandboxId) -> Result<Sandbox> {
        self.services
            .repository
            .get(id)
            .await?
            .ok_or_else(|| CoreError::not_found("sandbox", id))
    }

    pub async fn list(&self) -> Result<Vec<Sandbox>> {
        self.services.repository.list().await
    }

    /// Rebuild in-memory state after a restart.
    ///
    /// Addresses of live records are reserved again. Records stuck in
    /// `creating` belonged to a saga that died with the process and are
    /// marked `error`. Returns the number of reserved addresses.
    pub async fn recover(&self) -> Result<usize> {
        let mut reserved = 0;
        for mut sandbox in self.list().await? {
            match sandbox.status {
                SandboxStatus::Error => continue,
                SandboxStatus::Creating => {
                    sandbox.status = SandboxStatus::Error;
                    sandbox.runtime.error = Some("interrupted by restart".into());
                    sandbox.touch();
                    self.services.repository.update(&sandbox).await?;
                    tracing::warn!(sandbox_id = %sandbox.id, "Interrupted build marked as failed");
                    continue;
                }
                SandboxStatus::Running | SandboxStatus::Stopped => {}
            }
            if let Some(ip) = &sandbox.runtime.ip_address {
                if self.services.network.mark_allocated(ip).await {
                    reserved += 1;
                }
            }
        }
        tracing::info!(reserved, "Recovered network allocations");
        Ok(reserved)
    }

    async fn guest_ip(&self, id: &SandboxId) -> Result<String> {
        let sandbox = self.get(id).await?;
        sandbox
            .runtime
            .ip_address
            .ok_or_else(|| CoreError::InvalidState {
                expected: "sandbox with an address".into(),
                actual: sandbox.status.to_string(),
            })
    }

    /// Run a shell command in a sandbox through its agent.
    pub async fn exec(&self, id: &SandboxId, command: &str, timeout: Duration) -> Result<ExecResult> {
        let ip = self.guest_ip(id).await?;
        self.services.agent.exec(&ip, command, timeout).await
    }

    /// Wait for the agent of an existing sandbox with the configured bounds.
    pub async fn wait_for_agent(&self, id: &SandboxId) -> Result<bool> {
        let ip = self.guest_ip(id).await?;
        Ok(self
            .services
            .agent
            .wait_for_agent(&ip, self.services.config.timing.agent_wait)
            .await)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::AgentWait;
    use crate::network::mac_for_octet;
    use crate::repository::InMemoryRepository;
    use crate::secrets::PlaintextCipher;
    use crate::testing::{FakeAgent, FakeHypervisor, FakeProxy, FakeRunner};
    use crate::workspace::{
        InMemoryCatalog, PrebuildInfo, PrebuildStatus, RepoConfig, RepoSource, Workspace,
        WorkspaceConfig,
    };
    use tempfile::TempDir;

    pub(crate) struct Harness {
        pub runner: Arc<FakeRunner>,
        pub hypervisor: Arc<FakeHypervisor>,
        pub agent: Arc<FakeAgent>,
        pub proxy: Arc<FakeProxy>,
        pub repository: Arc<InMemoryRepository>,
        pub catalog: Arc<InMemoryCatalog>,
        pub controller: Arc<LifecycleController>,
        pub dir: TempDir,
    }

    pub(crate) fn test_config(dir: &std::path::Path, mode: RuntimeMode) -> CoreConfig {
        let mut config = CoreConfig {
            mode,
            ..Default::default()
        };
        config.storage.overlay_dir = dir.join("overlays");
        config.storage.base_rootfs = dir.join("rootfs.ext4");
        config.paths.mount_root = dir.join("mnt");
        config.paths.socket_dir = dir.join("sockets");
        config.paths.log_dir = dir.join("logs");
        config.paths.cpu_template = None;
        config.timing.agent_wait = AgentWait {
            timeout: Duration::from_millis(60),
            interval: Duration::from_millis(10),
        };
        config
    }

    pub(crate) fn harness_with(runner: FakeRunner, agent: FakeAgent, mode: RuntimeMode) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("rootfs.ext4"), b"base image").unwrap();

        let runner = Arc::new(runner);
        let hypervisor = Arc::new(FakeHypervisor::new());
        let agent = Arc::new(agent);
        let proxy = Arc::new(FakeProxy::default());
        let repository = Arc::new(InMemoryRepository::new());
        let catalog = Arc::new(InMemoryCatalog::new());

        let services = Services::new(
            test_config(dir.path(), mode),
            runner.clone(),
            Collaborators {
                hypervisor: hypervisor.clone(),
                agent: agent.clone(),
                proxy: proxy.clone(),
                repository: repository.clone(),
                catalog: catalog.clone(),
                cipher: Arc::new(PlaintextCipher),
            },
        );
        Harness {
            runner,
            hypervisor,
            agent,
            proxy,
            repository,
            catalog,
            controller: Arc::new(LifecycleController::new(services)),
            dir,
        }
    }

    pub(crate) fn harness() -> Harness {
        harness_with(
            FakeRunner::with_pool("sandbox-vg"),
            FakeAgent::healthy(),
            RuntimeMode::Production,
        )
    }

    pub(crate) fn workspace_with_repo(id: &str) -> Workspace {
        Workspace {
            id: id.into(),
            name: "web".into(),
            config: WorkspaceConfig {
                repos: vec![RepoConfig {
                    source: RepoSource::Url {
                        url: "https://github.com/acme/web.git".into(),
                    },
                    branch: "main".into(),
                    clone_path: "/workspace/web".into(),
                }],
                init_commands: vec!["npm ci".into()],
                ..Default::default()
            },
        }
    }

    async fn assert_fully_rolled_back(h: &Harness, id: &SandboxId) {
        assert_eq!(h.proxy.route_count(id), 0);
        assert!(h.proxy.removals.lock().unwrap().contains(id));
        assert!(!h.runner.has_volume(&format!("sandbox-vg/sandbox-{id}")));
        assert_eq!(h.controller.services().network.available().await, 245);

        let record = h.controller.get(id).await.unwrap();
        assert_eq!(record.status, SandboxStatus::Error);
        assert!(record.runtime.error.is_some());
    }

    #[tokio::test]
    async fn test_create_reaches_running_with_every_field() {
        let h = harness();
        let sandbox = h.controller.create(CreateSandboxRequest::default()).await.unwrap();

        assert_eq!(sandbox.status, SandboxStatus::Running);
        assert_eq!(sandbox.runtime.ip_address.as_deref(), Some("172.16.0.10"));
        assert_eq!(sandbox.runtime.mac_address.as_deref(), Some(mac_for_octet(10).as_str()));
        assert_eq!(sandbox.runtime.pid, Some(4000));
        assert!(sandbox.runtime.urls.as_ref().unwrap().all_present());
        assert_eq!(sandbox.runtime.vcpus, 2);
        assert_eq!(sandbox.runtime.memory_mb, 2048);

        let stored = h.controller.get(&sandbox.id).await.unwrap();
        assert_eq!(stored, sandbox);

        let id = sandbox.id;
        assert_eq!(
            h.hypervisor.calls(),
            vec![format!("launch {id}"), format!("configure {id}"), format!("boot {id}")]
        );
        assert!(h.runner.has_volume(&format!("sandbox-vg/sandbox-{id}")));
        assert_eq!(h.runner.calls_matching("tuntap add").len(), 1);
        assert_eq!(h.proxy.route_count(&id), 1);
    }

    #[tokio::test]
    async fn test_machine_config_uses_volume_and_tap() {
        let h = harness();
        let sandbox = h
            .controller
            .create(CreateSandboxRequest {
                vcpus: Some(4),
                memory_mb: Some(4096),
                ..Default::default()
            })
            .await
            .unwrap();

        let configured = h.hypervisor.configured.lock().unwrap();
        let machine = configured.get(&sandbox.id).unwrap();
        assert_eq!(machine.vcpu_count, 4);
        assert_eq!(machine.memory_mib, 4096);
        assert_eq!(
            machine.root_drive.path_on_host,
            std::path::PathBuf::from(format!("/dev/sandbox-vg/sandbox-{}", sandbox.id))
        );
        assert_eq!(
            machine.network.as_ref().unwrap().host_dev_name,
            tap_name(&sandbox.id)
        );
    }

    #[tokio::test]
    async fn test_synthetic_mode_skips_virtualization() {
        let h = harness_with(FakeRunner::new(), FakeAgent::unreachable(), RuntimeMode::Synthetic);
        let sandbox = h.controller.create(CreateSandboxRequest::default()).await.unwrap();

        assert_eq!(sandbox.status, SandboxStatus::Running);
        assert!(sandbox.runtime.urls.as_ref().unwrap().all_present());
        assert!(h.hypervisor.calls().is_empty());
        assert!(h.runner.calls_matching("tuntap").is_empty());
        assert_eq!(h.proxy.route_count(&sandbox.id), 0);

        let pid = sandbox.runtime.pid.expect("running sandbox has a pid");
        assert_eq!(pid, steps::synthetic_pid(&sandbox.id));
        let stored = h.controller.get(&sandbox.id).await.unwrap();
        assert_eq!(stored.runtime.pid, Some(pid));

        // Destroy must not signal the made-up pid
        h.controller.destroy(&sandbox.id).await.unwrap();
        assert!(h.hypervisor.calls().is_empty());
    }

    #[tokio::test]
    async fn test_hypervisor_startup_failure_rolls_back() {
        let h = harness();
        *h.hypervisor.fail_launch.lock().unwrap() = true;
        let id = SandboxId::new();

        let err = h
            .controller
            .create_with_id(id, CreateSandboxRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::HypervisorStartup(_)), "{err:?}");

        assert_fully_rolled_back(&h, &id).await;
        assert_eq!(h.runner.calls_matching("link del").len(), 1);
        let record = h.controller.get(&id).await.unwrap();
        assert!(record.runtime.error.unwrap().starts_with("launch_hypervisor:"));
        assert!(h.hypervisor.calls().contains(&format!("terminate {id} None")));
    }

    #[tokio::test]
    async fn test_boot_timeout_kills_launched_process() {
        let h = harness();
        *h.hypervisor.fail_boot.lock().unwrap() = true;
        let id = SandboxId::new();

        let err = h
            .controller
            .create_with_id(id, CreateSandboxRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::BootTimeout(_)));
        assert!(h.hypervisor.calls().contains(&format!("terminate {id} Some(4000)")));
        assert_fully_rolled_back(&h, &id).await;
    }

    #[tokio::test]
    async fn test_clone_failure_is_fatal() {
        let h = harness();
        h.catalog.insert(workspace_with_repo("ws-1")).await;
        *h.agent.fail_pattern.lock().unwrap() = Some("git clone".into());
        let id = SandboxId::new();

        let err = h
            .controller
            .create_with_id(id, CreateSandboxRequest::for_workspace("ws-1"))
            .await
            .unwrap_err();
        match err {
            CoreError::CloneFailure { repo, message } => {
                assert_eq!(repo, "https://github.com/acme/web.git");
                assert!(message.contains("repository not found"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_fully_rolled_back(&h, &id).await;
    }

    #[tokio::test]
    async fn test_clone_commands_run_in_order() {
        let h = harness();
        h.catalog.insert(workspace_with_repo("ws-1")).await;

        h.controller
            .create(CreateSandboxRequest::for_workspace("ws-1"))
            .await
            .unwrap();

        let commands = h.agent.commands();
        assert_eq!(
            commands,
            vec![
                "rm -rf '/home/dev/workspace/web'".to_string(),
                "git clone --depth 1 -b 'main' 'https://github.com/acme/web.git' '/home/dev/workspace/web'".into(),
                "chown -R dev:dev '/home/dev/workspace/web'".into(),
                r"su - dev -c 'git config --global --add safe.directory '\''/home/dev/workspace/web'\'''".into(),
            ]
        );
    }

    #[tokio::test]
    async fn test_agent_timeout_without_repos_is_not_fatal() {
        let h = harness_with(
            FakeRunner::with_pool("sandbox-vg"),
            FakeAgent::unreachable(),
            RuntimeMode::Production,
        );
        let sandbox = h.controller.create(CreateSandboxRequest::default()).await.unwrap();
        assert_eq!(sandbox.status, SandboxStatus::Running);
        assert!(h.agent.commands().is_empty());
    }

    #[tokio::test]
    async fn test_agent_timeout_with_repos_is_fatal() {
        let h = harness_with(
            FakeRunner::with_pool("sandbox-vg"),
            FakeAgent::unreachable(),
            RuntimeMode::Production,
        );
        h.catalog.insert(workspace_with_repo("ws-1")).await;
        let id = SandboxId::new();

        let err = h
            .controller
            .create_with_id(id, CreateSandboxRequest::for_workspace("ws-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::AgentUnreachable { .. }));
        assert_fully_rolled_back(&h, &id).await;
    }

    #[tokio::test]
    async fn test_ready_prebuild_skips_clone() {
        let h = harness();
        let mut ws = workspace_with_repo("ws-1");
        ws.config.prebuild = Some(PrebuildInfo {
            status: PrebuildStatus::Ready,
            ..Default::default()
        });
        h.catalog.insert(ws).await;
        h.runner.add_volume("sandbox-vg/prebuild-ws-1");

        let sandbox = h
            .controller
            .create(CreateSandboxRequest::for_workspace("ws-1"))
            .await
            .unwrap();

        assert_eq!(sandbox.status, SandboxStatus::Running);
        assert!(h.agent.commands().is_empty());
        let snapshot = h.runner.calls_matching("lvcreate");
        assert!(snapshot[0].ends_with("sandbox-vg/prebuild-ws-1"), "{snapshot:?}");
    }

    #[tokio::test]
    async fn test_prebuild_marked_ready_but_missing_falls_back_to_clone() {
        let h = harness();
        let mut ws = workspace_with_repo("ws-1");
        ws.config.prebuild = Some(PrebuildInfo {
            status: PrebuildStatus::Ready,
            ..Default::default()
        });
        h.catalog.insert(ws).await;

        h.controller
            .create(CreateSandboxRequest::for_workspace("ws-1"))
            .await
            .unwrap();
        assert!(h.agent.commands().iter().any(|c| c.starts_with("git clone")));
        let snapshot = h.runner.calls_matching("lvcreate");
        assert!(snapshot[0].ends_with("sandbox-vg/base-rootfs"), "{snapshot:?}");
    }

    #[tokio::test]
    async fn test_proxy_failure_rolls_back_everything() {
        let h = harness();
        *h.proxy.fail_register.lock().unwrap() = true;
        let id = SandboxId::new();

        let err = h
            .controller
            .create_with_id(id, CreateSandboxRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ProxyRegistration(_)));
        assert!(h.hypervisor.calls().contains(&format!("terminate {id} Some(4000)")));
        assert_fully_rolled_back(&h, &id).await;
    }

    #[tokio::test]
    async fn test_missing_pool_uses_overlay_copy() {
        let h = harness_with(FakeRunner::new(), FakeAgent::healthy(), RuntimeMode::Production);
        let sandbox = h.controller.create(CreateSandboxRequest::default()).await.unwrap();

        let overlay = h.controller.services().volumes.overlay_path(&sandbox.id);
        assert_eq!(std::fs::read(&overlay).unwrap(), b"base image");
        let configured = h.hypervisor.configured.lock().unwrap();
        assert_eq!(configured[&sandbox.id].root_drive.path_on_host, overlay);
        assert_eq!(h.runner.calls_matching("mount -o loop").len(), 1);
    }

    #[tokio::test]
    async fn test_failure_after_overlay_removes_it() {
        let h = harness_with(FakeRunner::new(), FakeAgent::healthy(), RuntimeMode::Production);
        *h.hypervisor.fail_launch.lock().unwrap() = true;
        let id = SandboxId::new();

        h.controller
            .create_with_id(id, CreateSandboxRequest::default())
            .await
            .unwrap_err();
        assert!(!h.controller.services().volumes.overlay_path(&id).exists());
    }

    #[tokio::test]
    async fn test_missing_base_image_leaves_no_overlay() {
        let h = harness_with(FakeRunner::new(), FakeAgent::healthy(), RuntimeMode::Production);
        std::fs::remove_file(h.dir.path().join("rootfs.ext4")).unwrap();
        let id = SandboxId::new();

        let err = h
            .controller
            .create_with_id(id, CreateSandboxRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Io(_)), "{err:?}");

        assert!(!h.controller.services().volumes.overlay_path(&id).exists());
        assert!(h.hypervisor.calls().is_empty());
        assert_eq!(h.controller.services().network.available().await, 245);
        // The record is only written after the volume exists
        assert!(h.controller.get(&id).await.is_err());
    }

    #[tokio::test]
    async fn test_tap_failure_after_add_still_deletes_tap() {
        let runner = FakeRunner::with_pool("sandbox-vg");
        runner.fail_on("master");
        let h = harness_with(runner, FakeAgent::healthy(), RuntimeMode::Production);
        let id = SandboxId::new();

        let err = h
            .controller
            .create_with_id(id, CreateSandboxRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Command { .. }), "{err:?}");
        assert_eq!(h.runner.calls_matching("link del").len(), 1);
        assert!(h.hypervisor.calls().is_empty());
        assert_fully_rolled_back(&h, &id).await;
    }

    #[tokio::test]
    async fn test_unknown_workspace_fails_before_allocation() {
        let h = harness();
        let err = h
            .controller
            .create(CreateSandboxRequest::for_workspace("missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound { kind: "workspace", .. }));
        assert!(h.controller.list().await.unwrap().is_empty());
        assert!(h.runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_destroy_releases_everything_and_is_idempotent() {
        let h = harness();
        let sandbox = h.controller.create(CreateSandboxRequest::default()).await.unwrap();
        let id = sandbox.id;

        h.controller.destroy(&id).await.unwrap();
        h.controller.destroy(&id).await.unwrap();

        assert!(matches!(
            h.controller.get(&id).await.unwrap_err(),
            CoreError::NotFound { .. }
        ));
        assert!(!h.runner.has_volume(&format!("sandbox-vg/sandbox-{id}")));
        assert_eq!(h.proxy.route_count(&id), 0);
        assert_eq!(h.runner.calls_matching("link del").len(), 1);
        assert!(h.hypervisor.calls().contains(&format!("terminate {id} Some(4000)")));
        assert_eq!(h.controller.services().network.available().await, 245);
    }

    #[tokio::test]
    async fn test_destroyed_address_is_reused_first() {
        let h = harness();
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(h.controller.create(CreateSandboxRequest::default()).await.unwrap());
        }
        let octets: Vec<_> = ids
            .iter()
            .map(|s| s.runtime.ip_address.clone().unwrap())
            .collect();
        assert_eq!(octets, vec!["172.16.0.10", "172.16.0.11", "172.16.0.12"]);

        h.controller.destroy(&ids[1].id).await.unwrap();
        let next = h.controller.create(CreateSandboxRequest::default()).await.unwrap();
        assert_eq!(next.runtime.ip_address.as_deref(), Some("172.16.0.11"));
    }

    #[tokio::test]
    async fn test_destroy_refuses_creating_record() {
        let h = harness();
        let sandbox = Sandbox::creating(SandboxId::new(), None, Default::default());
        h.repository.create(&sandbox).await.unwrap();

        let err = h.controller.destroy(&sandbox.id).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_recover_reserves_live_addresses() {
        let h = harness();
        let mut running = Sandbox::creating(
            SandboxId::new(),
            None,
            crate::sandbox::SandboxRuntime {
                ip_address: Some("172.16.0.10".into()),
                ..Default::default()
            },
        );
        running.status = SandboxStatus::Running;
        h.repository.create(&running).await.unwrap();

        let stuck = Sandbox::creating(
            SandboxId::new(),
            None,
            crate::sandbox::SandboxRuntime {
                ip_address: Some("172.16.0.11".into()),
                ..Default::default()
            },
        );
        h.repository.create(&stuck).await.unwrap();

        assert_eq!(h.controller.recover().await.unwrap(), 1);
        assert_eq!(
            h.controller.get(&stuck.id).await.unwrap().status,
            SandboxStatus::Error
        );
        let next = h.controller.create(CreateSandboxRequest::default()).await.unwrap();
        assert_eq!(next.runtime.ip_address.as_deref(), Some("172.16.0.11"));
    }

    #[tokio::test]
    async fn test_exec_and_wait_use_record_address() {
        let h = harness();
        let sandbox = h.controller.create(CreateSandboxRequest::default()).await.unwrap();

        assert!(h.controller.wait_for_agent(&sandbox.id).await.unwrap());
        let result = h
            .controller
            .exec(&sandbox.id, "echo hi", Duration::from_secs(1))
            .await
            .unwrap();
        assert!(result.success());
        assert_eq!(h.agent.commands(), vec!["echo hi".to_string()]);
        assert!(h.controller.exec(&SandboxId::new(), "true", Duration::from_secs(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_creates_get_distinct_addresses() {
        let h = harness();
        let handles: Vec<_> = (0..5)
            .map(|_| {
                let controller = Arc::clone(&h.controller);
                tokio::spawn(async move { controller.create(CreateSandboxRequest::default()).await })
            })
            .collect();

        let mut ips = Vec::new();
        for handle in futures::future::join_all(handles).await {
            ips.push(handle.unwrap().unwrap().runtime.ip_address.unwrap());
        }
        ips.sort();
        ips.dedup();
        assert_eq!(ips.len(), 5);
        assert!(h.dir.path().exists());
    }
}
