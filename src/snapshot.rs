//! Persisted instance layout.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::{BookmarkInfo, EngineFault};

/// Coarse instance status recorded alongside a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Running,
    Idle,
    Completed,
}

/// Serializable fault information captured on a faulted completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaultInfo {
    pub message: String,
    pub source_activity: Option<String>,
}

impl From<&EngineFault> for FaultInfo {
    fn from(fault: &EngineFault) -> Self {
        Self {
            message: fault.message.clone(),
            source_activity: fault.source_activity.clone(),
        }
    }
}

/// The durable form of an instance: serialized engine state plus the
/// status, bookmark, and mapped-variable snapshots, and on completion the
/// outputs or fault.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub engine_state: Value,
    pub status: InstanceStatus,
    pub bookmarks: Vec<BookmarkInfo>,
    pub variables: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<HashMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault: Option<FaultInfo>,
    pub saved_at: i64,
}

impl InstanceSnapshot {
    pub fn is_completed(&self) -> bool {
        self.status == InstanceStatus::Completed
    }
}
