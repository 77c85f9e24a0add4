//! Guest network identity: address, MAC and TAP device per sandbox.
//!
//! Addresses come from a free set of host octets guarded by a mutex. The
//! lowest free octet is always handed out first, so a released address is
//! reused before the range grows.

use crate::command::CommandRunner;
use crate::config::NetworkConfig;
use crate::error::{CoreError, Result};
use crate::sandbox::SandboxId;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Network identity of one sandbox. Never persisted on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkAllocation {
    pub ip_address: String,
    pub mac_address: String,
    pub tap_device: String,
    pub gateway: String,
}

/// MAC address derived from the host octet.
pub fn mac_for_octet(octet: u8) -> String {
    format!("06:00:AC:10:00:{octet:02x}")
}

/// TAP device name for a sandbox.
///
/// Uses the first eight characters of the id. Two ids sharing that prefix
/// map to the same device name.
pub fn tap_name(id: &SandboxId) -> String {
    format!("tap-{}", id.short())
}

// ============================================================================
// Allocator
// ============================================================================

/// Hands out guest addresses from the configured octet range.
#[derive(Debug)]
pub struct NetworkAllocator {
    config: NetworkConfig,
    free: Mutex<BTreeSet<u8>>,
}

impl NetworkAllocator {
    pub fn new(config: NetworkConfig) -> Self {
        let free = (config.first_octet..=config.last_octet).collect();
        tracing::debug!(
            subnet = %config.guest_subnet,
            first = config.first_octet,
            last = config.last_octet,
            "Network allocator initialised"
        );
        Self {
            config,
            free: Mutex::new(free),
        }
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Reserve the lowest free address for `id`.
    ///
    /// # Errors
    /// Returns [`CoreError::ResourceExhausted`] when the range is fully used.
    pub async fn allocate(&self, id: &SandboxId) -> Result<NetworkAllocation> {
        let octet = {
            let mut free = self.free.lock().await;
            let octet = free.iter().next().copied().ok_or_else(|| {
                CoreError::ResourceExhausted {
                    subnet: self.config.guest_subnet.clone(),
                    first: self.config.first_octet,
                    last: self.config.last_octet,
                }
            })?;
            free.remove(&octet);
            octet
        };

        let allocation = NetworkAllocation {
            ip_address: format!("{}.{octet}", self.config.guest_subnet),
            mac_address: mac_for_octet(octet),
            tap_device: tap_name(id),
            gateway: self.config.bridge_ip.to_string(),
        };
        tracing::debug!(
            sandbox_id = %id,
            ip = %allocation.ip_address,
            tap = %allocation.tap_device,
            "Allocated network"
        );
        Ok(allocation)
    }

    /// Return an address to the pool. Unknown or already free addresses are ignored.
    pub async fn release(&self, ip: &str) {
        let Some(octet) = self.octet_of(ip) else {
            tracing::debug!(ip, "Ignoring release of address outside the guest range");
            return;
        };
        let newly_freed = self.free.lock().await.insert(octet);
        tracing::debug!(ip, newly_freed, "Released network");
    }

    /// Reserve an address that is already in use, e.g. after a restart.
    ///
    /// Returns `false` when the address is outside the range or already taken.
    pub async fn mark_allocated(&self, ip: &str) -> bool {
        match self.octet_of(ip) {
            Some(octet) => self.free.lock().await.remove(&octet),
            None => false,
        }
    }

    /// Number of addresses still free.
    pub async fn available(&self) -> usize {
        self.free.lock().await.len()
    }

    fn octet_of(&self, ip: &str) -> Option<u8> {
        let (subnet, last) = ip.rsplit_once('.')?;
        if subnet != self.config.guest_subnet {
            return None;
        }
        let octet: u8 = last.parse().ok()?;
        (self.config.first_octet..=self.config.last_octet)
            .contains(&octet)
            .then_some(octet)
    }
}

// ============================================================================
// TAP devices
// ============================================================================

/// Creates and removes TAP devices on the host bridge via `ip`.
#[derive(Clone)]
pub struct TapManager {
    runner: Arc<dyn CommandRunner>,
    bridge: String,
}

impl TapManager {
    pub fn new(runner: Arc<dyn CommandRunner>, bridge: impl Into<String>) -> Self {
        Self {
            runner,
            bridge: bridge.into(),
        }
    }

    /// Create `tap` and attach it to the bridge.
    pub async fn create(&self, tap: &str) -> Result<()> {
        self.runner
            .run_checked("ip", &["tuntap", "add", "dev", tap, "mode", "tap"])
            .await?;
        self.runner
            .run_checked("ip", &["link", "set", "dev", tap, "master", &self.bridge, "up"])
            .await?;
        tracing::debug!(tap, bridge = %self.bridge, "TAP device created");
        Ok(())
    }

    /// Delete `tap`. Missing devices are ignored.
    pub async fn delete(&self, tap: &str) {
        match self.runner.run("ip", &["link", "del", tap]).await {
            Ok(out) if out.success() => tracing::debug!(tap, "TAP device deleted"),
            Ok(out) => tracing::debug!(tap, stderr = %out.stderr.trim(), "TAP device not deleted"),
            Err(e) => tracing::warn!(tap, error = %e, "Failed to run TAP deletion"),
        }
    }
}
