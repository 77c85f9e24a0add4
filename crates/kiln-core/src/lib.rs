//! # kiln-core
//!
//! Provisioning layer for kiln development sandboxes.
//!
//! A sandbox is a Firecracker microVM with its own thin-snapshot root
//! volume, a TAP device on the host bridge, a guest address and a set of
//! reverse-proxy routes. This crate acquires those resources in order and
//! releases them again when any step fails.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                            kiln-core                             │
//! ├──────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌────────────────┐   build    ┌─────────────────────────────┐   │
//! │  │ AdmissionQueue │──────────▶│    LifecycleController      │   │
//! │  │ (max N builds) │            │  Saga<BuildContext>         │   │
//! │  └────────────────┘            └─────────────────────────────┘   │
//! │  ┌────────────────┐                 │                            │
//! │  │ PrebuildRunner │─────────────────┤                            │
//! │  └────────────────┘                 ▼                            │
//! │   NetworkAllocator   VolumeManager   Hypervisor   RouteRegistrar │
//! │   TapManager         (LVM thin)      (kiln-vm)    (Caddy admin)  │
//! │   GuestConfigWriter  GuestAgent      SandboxRepository           │
//! │                                                                  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use kiln_core::{
//!     CoreConfig, CreateSandboxRequest, InMemoryCatalog, InMemoryRepository,
//!     LifecycleController, PlaintextCipher, Services,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> kiln_core::Result<()> {
//! let services = Services::from_config(
//!     CoreConfig::default(),
//!     Arc::new(InMemoryRepository::new()),
//!     Arc::new(InMemoryCatalog::new()),
//!     Arc::new(PlaintextCipher),
//! );
//! let controller = LifecycleController::new(services);
//!
//! let sandbox = controller
//!     .create(CreateSandboxRequest::for_workspace("web"))
//!     .await?;
//! println!("VS Code at {}", sandbox.runtime.urls.unwrap().vscode);
//!
//! controller.destroy(&sandbox.id).await?;
//! # Ok(())
//! # }
//! ```

mod agent;
mod command;
mod config;
mod error;
mod guest;
mod hypervisor;
mod lifecycle;
mod network;
mod prebuild;
mod proxy;
mod queue;
mod repository;
mod saga;
mod sandbox;
mod secrets;
mod volume;
mod workspace;

#[cfg(test)]
mod testing;

pub use agent::{AgentClient, AgentHealth, ExecResult, GuestAgent};
pub use command::{CommandOutput, CommandRunner, DryRunRunner, SystemRunner};
pub use config::{
    AgentWait, CoreConfig, NetworkConfig, PathsConfig, ProxyConfig, RuntimeMode, SandboxDefaults,
    ServicePorts, StorageConfig, TimingConfig,
};
pub use error::{CoreError, Result};
pub use guest::{
    AgentPushWriter, GuestConfigWriter, GuestFile, GuestManifest, GuestTarget, MountWriter,
    WritePhase,
};
pub use hypervisor::{FirecrackerHypervisor, Hypervisor};
pub use lifecycle::{Collaborators, LifecycleController, Services};
pub use network::{mac_for_octet, tap_name, NetworkAllocation, NetworkAllocator, TapManager};
pub use prebuild::PrebuildRunner;
pub use proxy::{
    service_urls, CaddyRegistrar, DevRouteUrls, OfflineRegistrar, RouteRegistrar,
    WILDCARD_ROUTE_ID,
};
pub use queue::{
    AdmissionQueue, BuildHandler, Job, JobId, JobStatus, QueueConfig, QueueStats, CANCELLED,
};
pub use repository::{InMemoryRepository, SandboxRepository};
pub use saga::{Saga, SagaFailure, SagaStep};
pub use sandbox::{
    CreateSandboxRequest, Sandbox, SandboxId, SandboxRuntime, SandboxStatus, SandboxUrls,
};
pub use secrets::{render_env_file, PlaintextCipher, SecretCipher};
pub use volume::{RootDisk, VolumeManager, VolumeSource};
pub use workspace::{
    ConfigFile, FileSecret, GitSource, InMemoryCatalog, PrebuildInfo, PrebuildStatus, RepoConfig,
    RepoSource, Workspace, WorkspaceCatalog, WorkspaceConfig,
};
