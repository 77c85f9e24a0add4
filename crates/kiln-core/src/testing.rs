//! In-process stand-ins for host tools and guest services used by unit tests.

use crate::agent::{AgentHealth, ExecResult, GuestAgent};
use crate::command::{CommandOutput, CommandRunner};
use crate::error::{CoreError, Result};
use crate::hypervisor::Hypervisor;
use crate::proxy::{service_urls, RouteRegistrar};
use crate::sandbox::{SandboxId, SandboxUrls};
use async_trait::async_trait;
use kiln_vm::MachineConfig;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

// ============================================================================
// Host commands
// ============================================================================

/// Records every command and emulates `lvs`/`lvcreate`/`lvremove` against an
/// in-memory set of logical volumes.
#[derive(Default)]
pub struct FakeRunner {
    calls: Mutex<Vec<String>>,
    volumes: Mutex<BTreeSet<String>>,
    failures: Mutex<Vec<String>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// A runner whose volume group already has a thin pool and base volume.
    pub fn with_pool(vg: &str) -> Self {
        let runner = Self::new();
        runner.add_volume(&format!("{vg}/thin-pool"));
        runner.add_volume(&format!("{vg}/base-rootfs"));
        runner
    }

    pub fn add_volume(&self, full_name: &str) {
        self.volumes.lock().unwrap().insert(full_name.to_string());
    }

    pub fn has_volume(&self, full_name: &str) -> bool {
        self.volumes.lock().unwrap().contains(full_name)
    }

    /// Fail every command whose rendered line contains `pattern`.
    pub fn fail_on(&self, pattern: &str) {
        self.failures.lock().unwrap().push(pattern.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_matching(&self, pattern: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.contains(pattern))
            .collect()
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        let name = Path::new(program)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| program.to_string());
        let line = std::iter::once(name.as_str())
            .chain(args.iter().copied())
            .collect::<Vec<_>>()
            .join(" ");
        self.calls.lock().unwrap().push(line.clone());

        if self
            .failures
            .lock()
            .unwrap()
            .iter()
            .any(|p| line.contains(p.as_str()))
        {
            return Ok(CommandOutput::failed(5, format!("injected failure: {line}")));
        }

        let last = args.last().copied().unwrap_or_default();
        let mut volumes = self.volumes.lock().unwrap();
        let output = match name.as_str() {
            "lvs" if args.contains(&"--noheadings") => {
                let prefix = format!("{last}/");
                let names: Vec<String> = volumes
                    .iter()
                    .filter_map(|v| v.strip_prefix(&prefix).map(|n| format!("  {n}")))
                    .collect();
                CommandOutput::ok(names.join("\n"))
            }
            "lvs" if volumes.contains(last) => CommandOutput::ok(""),
            "lvs" => CommandOutput::failed(5, "Failed to find logical volume"),
            "lvcreate" => {
                let name_idx = args.iter().position(|a| *a == "-n").map(|i| i + 1);
                let vg = last.split('/').next().unwrap_or_default();
                match name_idx.and_then(|i| args.get(i)) {
                    Some(new_name) if volumes.contains(last) => {
                        volumes.insert(format!("{vg}/{new_name}"));
                        CommandOutput::ok("")
                    }
                    _ => CommandOutput::failed(5, "origin not found"),
                }
            }
            "lvremove" => {
                if volumes.remove(last) {
                    CommandOutput::ok("")
                } else {
                    CommandOutput::failed(5, "Failed to find logical volume")
                }
            }
            _ => CommandOutput::ok(""),
        };
        Ok(output)
    }
}

// ============================================================================
// Hypervisor
// ============================================================================

/// Hypervisor that records calls and can be told to fail at one stage.
#[derive(Default)]
pub struct FakeHypervisor {
    pub calls: Mutex<Vec<String>>,
    pub fail_launch: Mutex<bool>,
    pub fail_boot: Mutex<bool>,
    next_pid: AtomicU32,
    pub configured: Mutex<HashMap<SandboxId, MachineConfig>>,
}

impl FakeHypervisor {
    pub fn new() -> Self {
        Self {
            next_pid: AtomicU32::new(4000),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Hypervisor for FakeHypervisor {
    async fn launch(&self, id: &SandboxId) -> Result<u32> {
        self.calls.lock().unwrap().push(format!("launch {id}"));
        if *self.fail_launch.lock().unwrap() {
            return Err(kiln_vm::VmError::Startup {
                status: "exit status: 1".into(),
                log: "Error creating the Kvm object".into(),
            }
            .into());
        }
        Ok(self.next_pid.fetch_add(1, Ordering::Relaxed))
    }

    async fn configure(&self, id: &SandboxId, machine: &MachineConfig) -> Result<()> {
        self.calls.lock().unwrap().push(format!("configure {id}"));
        self.configured.lock().unwrap().insert(*id, machine.clone());
        Ok(())
    }

    async fn boot(&self, id: &SandboxId) -> Result<()> {
        self.calls.lock().unwrap().push(format!("boot {id}"));
        if *self.fail_boot.lock().unwrap() {
            return Err(CoreError::BootTimeout(Duration::from_secs(30)));
        }
        Ok(())
    }

    async fn terminate(&self, id: &SandboxId, pid: Option<u32>, _grace: Duration) {
        self.calls
            .lock()
            .unwrap()
            .push(format!("terminate {id} {pid:?}"));
    }
}

// ============================================================================
// Guest agent
// ============================================================================

/// Agent that is healthy after a configurable number of polls.
#[derive(Default)]
pub struct FakeAgent {
    /// Health polls answered unhealthy before the agent comes up; `None` never.
    pub healthy_after: Mutex<Option<u32>>,
    polls: AtomicU32,
    pub commands: Mutex<Vec<String>>,
    /// Commands containing this pattern exit non-zero.
    pub fail_pattern: Mutex<Option<String>>,
}

impl FakeAgent {
    pub fn healthy() -> Self {
        Self {
            healthy_after: Mutex::new(Some(0)),
            ..Default::default()
        }
    }

    pub fn unreachable() -> Self {
        Self::default()
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

#[async_trait]
impl GuestAgent for FakeAgent {
    async fn health(&self, host: &str) -> Result<AgentHealth> {
        let polls = self.polls.fetch_add(1, Ordering::Relaxed);
        match *self.healthy_after.lock().unwrap() {
            Some(after) if polls >= after => Ok(AgentHealth {
                status: "healthy".into(),
                ..Default::default()
            }),
            _ => Err(CoreError::Agent(format!("connection refused: {host}"))),
        }
    }

    async fn exec(&self, _host: &str, command: &str, _timeout: Duration) -> Result<ExecResult> {
        self.commands.lock().unwrap().push(command.to_string());
        let fail = self
            .fail_pattern
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|p| command.contains(p.as_str()));
        Ok(if fail {
            ExecResult {
                exit_code: 128,
                stdout: String::new(),
                stderr: "fatal: repository not found".into(),
            }
        } else {
            ExecResult {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            }
        })
    }
}

// ============================================================================
// Proxy
// ============================================================================

/// Route registrar keeping routes in a map keyed by sandbox.
#[derive(Default)]
pub struct FakeProxy {
    pub routes: Mutex<HashMap<SandboxId, SandboxUrls>>,
    pub removals: Mutex<Vec<SandboxId>>,
    pub fail_register: Mutex<bool>,
}

impl FakeProxy {
    pub fn route_count(&self, id: &SandboxId) -> usize {
        usize::from(self.routes.lock().unwrap().contains_key(id))
    }
}

#[async_trait]
impl RouteRegistrar for FakeProxy {
    fn urls(&self, id: &SandboxId, ip: &str) -> SandboxUrls {
        service_urls(id, ip, "sandbox.test")
    }

    async fn register_routes(
        &self,
        id: &SandboxId,
        ip: &str,
        _ports: &crate::config::ServicePorts,
    ) -> Result<SandboxUrls> {
        if *self.fail_register.lock().unwrap() {
            return Err(CoreError::ProxyRegistration("admin API returned 500".into()));
        }
        let urls = self.urls(id, ip);
        self.routes.lock().unwrap().insert(*id, urls.clone());
        Ok(urls)
    }

    async fn remove_routes(&self, id: &SandboxId) -> Result<()> {
        self.removals.lock().unwrap().push(*id);
        self.routes.lock().unwrap().remove(id);
        Ok(())
    }
}
