//! Durable instance stores.
//!
//! An [`InstanceStore`] records checkpointed instance state under an
//! instance identity and an owning scope. The control core speaks a small
//! command protocol: it binds a handle for an owner, executes commands
//! against it, and frees the handle when done. Two implementations ship
//! with the crate: [`MemoryInstanceStore`] and [`FileInstanceStore`].

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;
use crate::snapshot::InstanceSnapshot;

mod file;
mod memory;

pub use file::FileInstanceStore;
pub use memory::MemoryInstanceStore;

/// Identity of the host owning a set of instances in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerId(Uuid);

impl OwnerId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Durable identity of a single workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId(Uuid);

impl InstanceId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<Uuid> for InstanceId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

/// A bound (owner, instance) pair commands execute against.
#[derive(Debug, Clone)]
pub struct StoreHandle {
    pub owner: OwnerId,
    pub instance: InstanceId,
}

/// Commands the control core issues against a handle.
#[derive(Debug)]
pub enum StoreCommand {
    /// Register the handle's instance identity and take its lock.
    CreateInstance,
    /// Remove the instance and everything recorded under it.
    DeleteInstance,
    /// Record a snapshot. `complete` tags the data as terminal; `unlock`
    /// releases the instance lock along with the save.
    Save {
        snapshot: InstanceSnapshot,
        complete: bool,
        unlock: bool,
    },
    /// Read the snapshot for the handle's instance and take its lock.
    Load,
    /// Find any unlocked runnable instance, lock it, and read it.
    TryLoadRunnable,
}

/// What a command produced.
#[derive(Debug)]
pub struct StoreView {
    pub instance: InstanceId,
    pub snapshot: Option<InstanceSnapshot>,
}

/// External system recording checkpointed state under an instance identity
/// and owning scope.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// Bind a handle for `owner`, minting a fresh instance identity when
    /// `instance` is `None`.
    async fn create_handle(
        &self,
        owner: OwnerId,
        instance: Option<InstanceId>,
    ) -> Result<StoreHandle, StoreError>;

    async fn execute(
        &self,
        handle: &StoreHandle,
        command: StoreCommand,
        timeout: Duration,
    ) -> Result<StoreView, StoreError>;

    /// Release any lock the handle still holds. Never fails.
    async fn free(&self, handle: &StoreHandle);
}
