//! Instance notifications: the action-returning handler trait driven
//! while holding the turn, and a passive event stream for observers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

use super::persistence::PersistKind;
use crate::engine::{ActivityCompletion, BookmarkInfo, CompletionOutcome, EngineFault};

/// Follow-up the host selects from a persistable-idle notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PersistableIdleAction {
    #[default]
    None,
    Persist,
    Unload,
}

/// How the host wants an unhandled activity fault resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnhandledExceptionAction {
    Abort,
    Cancel,
    #[default]
    Terminate,
}

/// Context handed to idle notifications.
#[derive(Debug, Clone)]
pub struct IdleInfo {
    pub bookmarks: Vec<BookmarkInfo>,
}

/// Host callbacks, all invoked while the instance turn is held so they
/// are mutually exclusive in time with every control operation.
#[async_trait]
pub trait InstanceHandler: Send + Sync {
    async fn on_idle(&self, _info: &IdleInfo) {}

    /// Raised when the instance idles inside a persistable zone and a
    /// store or pipeline is configured.
    async fn on_persistable_idle(&self, _info: &IdleInfo) -> PersistableIdleAction {
        PersistableIdleAction::None
    }

    async fn on_completed(&self, _outcome: &CompletionOutcome) {}

    async fn on_unhandled_exception(&self, _fault: &EngineFault) -> UnhandledExceptionAction {
        UnhandledExceptionAction::Terminate
    }

    async fn on_aborted(&self, _reason: &str) {}

    async fn on_unloaded(&self) {}
}

/// Handler that accepts every default.
pub struct NoopHandler;

#[async_trait]
impl InstanceHandler for NoopHandler {}

/// Observational instance events, serialized with respect to the turn.
#[derive(Clone, Debug, Serialize)]
pub enum InstanceEvent {
    Idle {
        bookmarks: Vec<BookmarkInfo>,
        timestamp: DateTime<Utc>,
    },
    Persisted {
        kind: PersistKind,
        timestamp: DateTime<Utc>,
    },
    Completed {
        completion: ActivityCompletion,
        timestamp: DateTime<Utc>,
    },
    UnhandledException {
        message: String,
        source_activity: Option<String>,
        timestamp: DateTime<Utc>,
    },
    Aborted {
        reason: String,
        timestamp: DateTime<Utc>,
    },
    Unloaded {
        timestamp: DateTime<Utc>,
    },
}

/// Sender wrapper for instance events, with an atomic active flag so that
/// emission can be cheaply skipped when no listener is attached.
#[derive(Clone)]
pub struct EventEmitter {
    tx: Option<mpsc::Sender<InstanceEvent>>,
    active: Arc<AtomicBool>,
}

impl EventEmitter {
    pub fn new(tx: Option<mpsc::Sender<InstanceEvent>>) -> Self {
        let active = tx.is_some();
        Self {
            tx,
            active: Arc::new(AtomicBool::new(active)),
        }
    }

    #[inline(always)]
    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub(crate) async fn emit(&self, event: InstanceEvent) {
        if !self.is_active() {
            return;
        }
        if let Some(tx) = &self.tx {
            if tx.send(event).await.is_err() {
                // Receiver detached; stop paying for emission.
                self.active.store(false, Ordering::Relaxed);
            }
        }
    }
}
