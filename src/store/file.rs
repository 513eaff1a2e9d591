use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{InstanceId, InstanceStore, OwnerId, StoreCommand, StoreHandle, StoreView};
use crate::error::StoreError;
use crate::snapshot::InstanceSnapshot;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FileRecord {
    snapshot: Option<InstanceSnapshot>,
    locked_by: Option<OwnerId>,
    completed: bool,
}

/// File-backed instance store: one JSON file per instance under a
/// directory. Lock state lives inside the record, serialized by an
/// in-process mutex; this store targets a single host process per
/// directory.
pub struct FileInstanceStore {
    dir: PathBuf,
    io_lock: tokio::sync::Mutex<()>,
}

impl FileInstanceStore {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|e| StoreError::Storage(e.to_string()))?;
        Ok(Self {
            dir,
            io_lock: tokio::sync::Mutex::new(()),
        })
    }

    fn path_for(&self, instance: InstanceId) -> PathBuf {
        self.dir.join(format!("{}.instance.json", instance))
    }

    async fn read_record(&self, instance: InstanceId) -> Result<Option<FileRecord>, StoreError> {
        let bytes = match tokio::fs::read(self.path_for(instance)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::Storage(e.to_string())),
        };
        let record = serde_json::from_slice::<FileRecord>(&bytes)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(Some(record))
    }

    async fn write_record(
        &self,
        instance: InstanceId,
        record: &FileRecord,
    ) -> Result<(), StoreError> {
        let bytes =
            serde_json::to_vec(record).map_err(|e| StoreError::Serialization(e.to_string()))?;
        tokio::fs::write(self.path_for(instance), bytes)
            .await
            .map_err(|e| StoreError::Storage(e.to_string()))
    }

    async fn execute_inner(
        &self,
        handle: &StoreHandle,
        command: StoreCommand,
    ) -> Result<StoreView, StoreError> {
        let _guard = self.io_lock.lock().await;
        match command {
            StoreCommand::CreateInstance => {
                if self.read_record(handle.instance).await?.is_some() {
                    return Err(StoreError::AlreadyExists(handle.instance));
                }
                let record = FileRecord {
                    snapshot: None,
                    locked_by: Some(handle.owner),
                    completed: false,
                };
                self.write_record(handle.instance, &record).await?;
                Ok(StoreView {
                    instance: handle.instance,
                    snapshot: None,
                })
            }
            StoreCommand::DeleteInstance => {
                let record = self
                    .read_record(handle.instance)
                    .await?
                    .ok_or(StoreError::NotFound(handle.instance))?;
                if record
                    .locked_by
                    .is_some_and(|locker| locker != handle.owner)
                {
                    return Err(StoreError::NotAuthorized);
                }
                let _ = tokio::fs::remove_file(self.path_for(handle.instance)).await;
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
                let mut record = self
                    .read_record(handle.instance)
                    .await?
                    .ok_or(StoreError::NotFound(handle.instance))?;
                if record.locked_by != Some(handle.owner) {
                    return Err(StoreError::LockConflict(handle.instance));
                }
                record.snapshot = Some(snapshot);
                record.completed = complete;
                if unlock {
                    record.locked_by = None;
                }
                self.write_record(handle.instance, &record).await?;
                Ok(StoreView {
                    instance: handle.instance,
                    snapshot: None,
                })
            }
            StoreCommand::Load => {
                let mut record = self
                    .read_record(handle.instance)
                    .await?
                    .ok_or(StoreError::NotFound(handle.instance))?;
                if record
                    .locked_by
                    .is_some_and(|locker| locker != handle.owner)
                {
                    return Err(StoreError::LockConflict(handle.instance));
                }
                record.locked_by = Some(handle.owner);
                self.write_record(handle.instance, &record).await?;
                Ok(StoreView {
                    instance: handle.instance,
                    snapshot: record.snapshot,
                })
            }
            StoreCommand::TryLoadRunnable => {
                let mut entries = tokio::fs::read_dir(&self.dir)
                    .await
                    .map_err(|e| StoreError::Storage(e.to_string()))?;
                while let Some(entry) = entries
                    .next_entry()
                    .await
                    .map_err(|e| StoreError::Storage(e.to_string()))?
                {
                    let name = entry.file_name();
                    let Some(stem) = name
                        .to_str()
                        .and_then(|name| name.strip_suffix(".instance.json"))
                    else {
                        continue;
                    };
                    let Ok(uuid) = stem.parse::<uuid::Uuid>() else {
                        continue;
                    };
                    let instance = InstanceId::from(uuid);
                    let Some(mut record) = self.read_record(instance).await? else {
                        continue;
                    };
                    if record.locked_by.is_some() || record.completed || record.snapshot.is_none() {
                        continue;
                    }
                    record.locked_by = Some(handle.owner);
                    let snapshot = record.snapshot.clone();
                    self.write_record(instance, &record).await?;
                    return Ok(StoreView { instance, snapshot });
                }
                Ok(StoreView {
                    instance: handle.instance,
                    snapshot: None,
                })
            }
        }
    }
}

#[async_trait]
impl InstanceStore for FileInstanceStore {
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
        timeout: Duration,
    ) -> Result<StoreView, StoreError> {
        match tokio::time::timeout(timeout, self.execute_inner(handle, command)).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout),
        }
    }

    async fn free(&self, handle: &StoreHandle) {
        let _guard = self.io_lock.lock().await;
        let Ok(Some(mut record)) = self.read_record(handle.instance).await else {
            return;
        };
        if record.locked_by == Some(handle.owner) {
            record.locked_by = None;
            if let Err(e) = self.write_record(handle.instance, &record).await {
                tracing::warn!("failed to release instance lock on free: {}", e);
            }
        }
    }
}
