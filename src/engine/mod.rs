//! The activity-tree engine seam.
//!
//! The control core never interprets activities itself; it drives an
//! [`ActivityEngine`] — the collaborator that executes the compiled
//! activity tree, owns argument/variable storage, and reports suspension.
//! Everything the core needs from the interpreter is behind this trait so
//! hosts can plug in their own engine (or a scripted one in tests).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::pause::PersistPause;

/// Coarse engine execution state as observed between turns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// No immediately runnable work, but the tree is not finished.
    Idle,
    /// The engine has schedulable work.
    Runnable,
    /// The root activity has reached a terminal state.
    Complete,
}

/// Terminal disposition of the root activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityCompletion {
    Closed,
    Canceled,
    Faulted,
}

/// An unhandled fault escaping activity execution.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct EngineFault {
    pub message: String,
    /// Display name of the activity the fault escaped from, when known.
    pub source_activity: Option<String>,
}

impl EngineFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source_activity: None,
        }
    }

    pub fn from_activity(message: impl Into<String>, activity: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source_activity: Some(activity.into()),
        }
    }
}

/// Outcome reported by the engine once it reaches [`EngineState::Complete`].
#[derive(Debug, Clone)]
pub struct CompletionOutcome {
    pub completion: ActivityCompletion,
    pub outputs: HashMap<String, Value>,
    pub fault: Option<EngineFault>,
}

/// Result of asking the engine to resume a named suspension point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookmarkResumption {
    /// The bookmark existed and the resumption was scheduled.
    Success,
    /// No such bookmark exists.
    NotFound,
    /// The bookmark exists but the engine cannot accept the resumption yet.
    NotReady,
}

/// A named suspension point an activity created to await external input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookmarkInfo {
    pub name: String,
    /// Display name of the owning activity scope, when the engine exposes it.
    pub owner: Option<String>,
}

impl BookmarkInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            owner: None,
        }
    }
}

/// A lifecycle tracking record the core hands to the engine's tracking
/// channel before user-visible notifications fire.
#[derive(Debug, Clone, Serialize)]
pub struct TrackingRecord {
    pub state: String,
    pub timestamp: DateTime<Utc>,
}

impl TrackingRecord {
    pub fn new(state: impl Into<String>) -> Self {
        Self {
            state: state.into(),
            timestamp: Utc::now(),
        }
    }
}

/// The activity-tree interpreter driven by the control core.
///
/// Methods taking `&mut self` are only invoked while the caller holds the
/// instance turn, so implementations need no internal locking beyond what
/// `state()` / `is_persistable()` require for cross-task reads.
#[async_trait]
pub trait ActivityEngine: Send + Sync {
    fn state(&self) -> EngineState;

    /// Whether execution currently sits inside a region that is safe to
    /// checkpoint.
    fn is_persistable(&self) -> bool;

    /// Receive the shared pause signal the core arms when a persistence
    /// operation is waiting behind a running turn.
    fn attach_pause_signal(&mut self, _signal: PersistPause) {}

    /// Drive the tree until the next suspension (idle, persistable pause,
    /// or completion). An unhandled activity fault is the error.
    async fn run(&mut self) -> Result<(), EngineFault>;

    async fn abort(&mut self, reason: &str);

    /// Schedule termination; the next `run` drives the tree to a
    /// `Faulted` completion carrying the reason.
    async fn terminate(&mut self, reason: &str);

    /// Schedule cancellation of the root; the next `run` drives the tree
    /// to a `Canceled` completion.
    fn schedule_cancel(&mut self);

    fn schedule_bookmark_resumption(&mut self, name: &str, value: Value) -> BookmarkResumption;

    fn bookmarks(&self) -> Vec<BookmarkInfo>;

    /// Terminal outcome; `Some` once `state()` is `Complete`.
    fn completion_state(&self) -> Option<CompletionOutcome>;

    fn track(&mut self, record: TrackingRecord);

    fn has_pending_tracking(&self) -> bool;

    async fn flush_tracking(&mut self, timeout: Duration) -> Result<(), EngineFault>;

    /// Snapshot the live tree into its serialized form.
    fn prepare_for_serialization(&mut self) -> Result<Value, EngineFault>;

    /// Rebuild the live tree from a serialized snapshot (load path).
    fn hydrate(&mut self, state: Value) -> Result<(), EngineFault>;
}
