use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use super::{InstanceId, InstanceStore, OwnerId, StoreCommand, StoreHandle, StoreView};
use crate::error::StoreError;

#[derive(Debug, Clone, Default)]
struct Record {
    snapshot: Option<crate::snapshot::InstanceSnapshot>,
    locked_by: Option<OwnerId>,
    completed: bool,
}

/// In-memory instance store, mainly for tests and single-process hosts.
#[derive(Default)]
pub struct MemoryInstanceStore {
    data: tokio::sync::RwLock<HashMap<InstanceId, Record>>,
}

impl MemoryInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the given instance currently holds a lock (test inspection).
    pub async fn is_locked(&self, instance: InstanceId) -> bool {
        self.data
            .read()
            .await
            .get(&instance)
            .is_some_and(|record| record.locked_by.is_some())
    }

    /// Whether the given instance exists at all (test inspection).
    pub async fn contains(&self, instance: InstanceId) -> bool {
        self.data.read().await.contains_key(&instance)
    }

    /// Number of instances currently recorded (test inspection).
    pub async fn len(&self) -> usize {
        self.data.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl InstanceStore for MemoryInstanceStore {
    async fn create_handle(
        &self,
        owner: OwnerId,
        instance: Option<InstanceId>,
    ) -> Result<StoreHandle, StoreError> {
        Ok(StoreHandle {
            owner,
            instance: instance.unwrap_or_else(InstanceId::generate),
        })
    }

    async fn execute(
        &self,
        handle: &StoreHandle,
        command: StoreCommand,
        _timeout: Duration,
    ) -> Result<StoreView, StoreError> {
        let mut data = self.data.write().await;
        match command {
            StoreCommand::CreateInstance => {
                if data.contains_key(&handle.instance) {
                    return Err(StoreError::AlreadyExists(handle.instance));
                }
                data.insert(
                    handle.instance,
                    Record {
                        snapshot: None,
                        locked_by: Some(handle.owner),
                        completed: false,
                    },
                );
                Ok(StoreView {
                    instance: handle.instance,
                    snapshot: None,
                })
            }
            StoreCommand::DeleteInstance => {
                let record = data
                    .get(&handle.instance)
                    .ok_or(StoreError::NotFound(handle.instance))?;
                if record
                    .locked_by
                    .is_some_and(|locker| locker != handle.owner)
                {
                    return Err(StoreError::NotAuthorized);
                }
                data.remove(&handle.instance);
                Ok(StoreView {
                    instance: handle.instance,
                    snapshot: None,
                })
            }
            StoreCommand::Save {
                snapshot,
                complete,
                unlock,
            } => {
                let record = data
                    .get_mut(&handle.instance)
                    .ok_or(StoreError::NotFound(handle.instance))?;
                if record.locked_by != Some(handle.owner) {
                    return Err(StoreError::LockConflict(handle.instance));
                }
                record.snapshot = Some(snapshot);
                record.completed = complete;
                if unlock {
                    record.locked_by = None;
                }
                Ok(StoreView {
                    instance: handle.instance,
                    snapshot: None,
                })
            }
            StoreCommand::Load => {
                let record = data
                    .get_mut(&handle.instance)
                    .ok_or(StoreError::NotFound(handle.instance))?;
                if record
                    .locked_by
                    .is_some_and(|locker| locker != handle.owner)
                {
                    return Err(StoreError::LockConflict(handle.instance));
                }
                record.locked_by = Some(handle.owner);
                Ok(StoreView {
                    instance: handle.instance,
                    snapshot: record.snapshot.clone(),
                })
            }
            StoreCommand::TryLoadRunnable => {
                let candidate = data.iter_mut().find(|(_, record)| {
                    record.locked_by.is_none() && !record.completed && record.snapshot.is_some()
                });
                match candidate {
                    Some((id, record)) => {
                        record.locked_by = Some(handle.owner);
                        Ok(StoreView {
                            instance: *id,
                            snapshot: record.snapshot.clone(),
                        })
                    }
                    None => Ok(StoreView {
                        instance: handle.instance,
                        snapshot: None,
                    }),
                }
            }
        }
    }

    async fn free(&self, handle: &StoreHandle) {
        let mut data = self.data.write().await;
        if let Some(record) = data.get_mut(&handle.instance) {
            if record.locked_by == Some(handle.owner) {
                record.locked_by = None;
            }
        }
    }
}
