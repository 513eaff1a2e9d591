//! Pending control operations and their one-shot grant signal.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// What an operation needs from the instance before it may hold the turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OperationKind {
    /// Admissible whenever the turn is free.
    Generic,
    /// Admissible once the engine reports Idle (or Complete, so terminal
    /// observations are never starved).
    RequiresIdle,
    /// A retried idle operation, admissible only after the admission
    /// counter has advanced past its stamp — proof that something happened
    /// since the engine last refused it.
    DeferredRequiresIdle,
    /// Admissible only inside a persistable zone.
    RequiresPersistable,
}

/// A host intent parked in the admission queue until it is granted the
/// turn. Created per call, dispatched or removed exactly once, never
/// reused.
pub(crate) struct Operation {
    kind: OperationKind,
    preempts_engine: bool,
    requires_initialized: bool,
    stamp: AtomicU64,
    notified: AtomicBool,
    signal: Notify,
}

impl Operation {
    pub(crate) fn new(
        kind: OperationKind,
        preempts_engine: bool,
        requires_initialized: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            kind,
            preempts_engine,
            requires_initialized,
            stamp: AtomicU64::new(0),
            notified: AtomicBool::new(false),
            signal: Notify::new(),
        })
    }

    pub(crate) fn kind(&self) -> OperationKind {
        self.kind
    }

    pub(crate) fn preempts_engine(&self) -> bool {
        self.preempts_engine
    }

    pub(crate) fn requires_initialized(&self) -> bool {
        self.requires_initialized
    }

    /// Admission stamp, assigned under the control mutex at enqueue time.
    pub(crate) fn stamp(&self) -> u64 {
        self.stamp.load(Ordering::Relaxed)
    }

    pub(crate) fn set_stamp(&self, stamp: u64) {
        self.stamp.store(stamp, Ordering::Relaxed);
    }

    pub(crate) fn is_notified(&self) -> bool {
        self.notified.load(Ordering::Acquire)
    }

    /// Hand the turn to this operation. Called at most once, under the
    /// control mutex; the stored permit wakes the waiter even if it has
    /// not started waiting yet.
    pub(crate) fn grant(&self) {
        self.notified.store(true, Ordering::Release);
        self.signal.notify_one();
    }

    /// Wait until the turn is granted.
    pub(crate) async fn acquired(&self) {
        self.signal.notified().await;
    }
}
