//! # kiln-vm
//!
//! Firecracker control for kiln sandboxes: spawns the hypervisor process,
//! talks to its private API socket and keeps per-sandbox paths deterministic
//! so a restarted controller can find what it launched.
//!
//! ## Quick Start
//!
//! ```no_run
//! use kiln_vm::{LaunchOptions, VmBuilder, VmPaths};
//! use std::path::Path;
//! use std::time::Duration;
//!
//! # async fn example() -> kiln_vm::Result<()> {
//! let paths = VmPaths::for_sandbox(
//!     Path::new("/var/lib/sandbox/sockets"),
//!     Path::new("/var/log/sandbox"),
//!     "demo",
//! );
//!
//! let mut vm = VmBuilder::new()
//!     .vcpus(2)
//!     .memory_mib(2048)
//!     .kernel("/var/lib/sandbox/firecracker/kernels/vmlinux")
//!     .rootfs("/dev/sandbox-vg/sandbox-demo")
//!     .launch("demo", paths, &LaunchOptions::default())
//!     .await?;
//!
//! vm.boot(Duration::from_secs(30)).await?;
//! vm.kill(Duration::from_millis(500)).await?;
//! # Ok(())
//! # }
//! ```

mod builder;
mod client;
mod config;
mod error;
mod machine;
mod paths;
mod process;

pub use builder::VmBuilder;
pub use client::{FirecrackerClient, InstanceInfo, SOCKET_TIMEOUT};
pub use config::{DriveConfig, MachineConfig, NetworkInterfaceConfig, DEFAULT_BOOT_ARGS};
pub use error::{Result, VmError};
pub use machine::{VirtualMachine, VmState};
pub use paths::VmPaths;
pub use process::{
    is_alive, spawn_firecracker, spawn_supervised, terminate, FirecrackerProcess, LaunchOptions,
    STARTUP_GRACE,
};
