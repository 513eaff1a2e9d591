//! Durable-store errors.

use thiserror::Error;

use crate::store::InstanceId;

/// Errors raised by an [`InstanceStore`](crate::store::InstanceStore).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Instance not found: {0}")]
    NotFound(InstanceId),
    #[error("Instance already exists: {0}")]
    AlreadyExists(InstanceId),
    #[error("Instance {0} is locked by another owner")]
    LockConflict(InstanceId),
    #[error("Owner is not authorized for this instance")]
    NotAuthorized,
    #[error("Store command canceled")]
    Canceled,
    #[error("Store command timed out")]
    Timeout,
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Storage error: {0}")]
    Storage(String),
}

impl StoreError {
    /// Whether a failed best-effort cleanup (owner deletion, unlock) may be
    /// swallowed instead of failing the persistence episode.
    pub fn is_ignorable_cleanup_failure(&self) -> bool {
        matches!(
            self,
            StoreError::NotFound(_) | StoreError::NotAuthorized | StoreError::Canceled
        )
    }
}
