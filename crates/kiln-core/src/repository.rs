//! Persistence boundary for sandbox records.

use crate::error::{CoreError, Result};
use crate::sandbox::{Sandbox, SandboxId};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Keyed CRUD over sandbox records.
#[async_trait]
pub trait SandboxRepository: Send + Sync {
    async fn create(&self, sandbox: &Sandbox) -> Result<()>;

    async fn update(&self, sandbox: &Sandbox) -> Result<()>;

    async fn get(&self, id: &SandboxId) -> Result<Option<Sandbox>>;

    /// Deleting an absent record is not an error.
    async fn delete(&self, id: &SandboxId) -> Result<()>;

    async fn list(&self) -> Result<Vec<Sandbox>>;
}

/// Repository held in memory, ordered by creation time on listing.
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    records: RwLock<HashMap<SandboxId, Sandbox>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SandboxRepository for InMemoryRepository {
    async fn create(&self, sandbox: &Sandbox) -> Result<()> {
        let mut records = self.records.write().await;
        if records.contains_key(&sandbox.id) {
            return Err(CoreError::Repository(format!(
                "sandbox {} already exists",
                sandbox.id
            )));
        }
        records.insert(sandbox.id, sandbox.clone());
        Ok(())
    }

    async fn update(&self, sandbox: &Sandbox) -> Result<()> {
        let mut records = self.records.write().await;
        match records.get_mut(&sandbox.id) {
            Some(existing) => {
                *existing = sandbox.clone();
                Ok(())
            }
            None => Err(CoreError::not_found("sandbox", sandbox.id)),
        }
    }

    async fn get(&self, id: &SandboxId) -> Result<Option<Sandbox>> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn delete(&self, id: &SandboxId) -> Result<()> {
        self.records.write().await.remove(id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Sandbox>> {
        let mut all: Vec<Sandbox> = self.records.read().await.values().cloned().collect();
        all.sort_by_key(|s| s.created_at);
        Ok(all)
    }
}
