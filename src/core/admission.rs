//! The admission queue: pending operations, the busy flag, and the
//! monotonic admission counter, all under one coarse mutex.
//!
//! Exactly one turn — a granted operation or one engine activation — may
//! be logically active per instance. The queue enforces that with the
//! `busy` flag alone; the engine itself is never locked for admission
//! decisions, which instead consult a mirror of its state refreshed by
//! the turn holder.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};

use super::lifecycle::InstanceLifecycle;
use super::operation::{Operation, OperationKind};
use super::pause::PersistPause;
use crate::engine::{CompletionOutcome, EngineState};
use crate::error::{ControlError, ControlResult};

/// Everything the coarse per-instance mutex protects.
pub(crate) struct ControlState {
    pending: VecDeque<Arc<Operation>>,
    pub(crate) busy: bool,
    pub(crate) counter: u64,
    pub(crate) lifecycle: InstanceLifecycle,
    /// Engine-state mirror, refreshed by the turn holder after every
    /// engine interaction so predicates never need the engine lock.
    pub(crate) engine_state: EngineState,
    pub(crate) engine_persistable: bool,
    pub(crate) initialized: bool,
    pub(crate) has_started: bool,
    pub(crate) completion_raised: bool,
    pub(crate) executed_since_idle: bool,
    pub(crate) has_aborted: bool,
    pub(crate) abort_reason: Option<String>,
    pub(crate) termination_reason: Option<String>,
    pub(crate) completion: Option<CompletionOutcome>,
}

impl ControlState {
    fn new(engine_state: EngineState, engine_persistable: bool) -> Self {
        Self {
            pending: VecDeque::new(),
            busy: false,
            counter: 0,
            lifecycle: InstanceLifecycle::Paused,
            engine_state,
            engine_persistable,
            initialized: false,
            has_started: false,
            completion_raised: false,
            executed_since_idle: false,
            has_aborted: false,
            abort_reason: None,
            termination_reason: None,
            completion: None,
        }
    }

    /// Whether the operation may hold the turn right now. Once the
    /// lifecycle is terminal the kind predicate is skipped entirely, so
    /// the dispatched caller observes the terminal state directly.
    fn admissible(&self, op: &Operation) -> bool {
        if self.lifecycle.is_terminal() {
            return true;
        }
        match op.kind() {
            OperationKind::Generic => true,
            OperationKind::RequiresIdle => matches!(
                self.engine_state,
                EngineState::Idle | EngineState::Complete
            ),
            OperationKind::DeferredRequiresIdle => {
                self.engine_state == EngineState::Complete
                    || (self.engine_state == EngineState::Idle && self.counter > op.stamp())
            }
            OperationKind::RequiresPersistable => {
                self.engine_persistable || self.engine_state == EngineState::Complete
            }
        }
    }

    fn grant(&mut self, op: &Arc<Operation>) {
        if op.requires_initialized() && !self.initialized {
            self.initialized = true;
        }
        self.counter += 1;
        op.grant();
    }

    /// Pop and grant the next admissible operation, head first, scanning
    /// past entries whose predicate is not yet satisfied so a
    /// not-yet-persistable operation never blocks a ready one behind it.
    pub(crate) fn find_next(&mut self) -> Option<Arc<Operation>> {
        let index = if self
            .pending
            .front()
            .is_some_and(|op| self.admissible(op))
        {
            Some(0)
        } else {
            self.pending.iter().position(|op| self.admissible(op))
        };
        let op = self.pending.remove(index?)?;
        self.grant(&op);
        Some(op)
    }
}

/// Pending-operation collection plus the busy flag; guarantees at most
/// one active turn per instance.
pub(crate) struct AdmissionQueue {
    state: Mutex<ControlState>,
    /// Operations between public-surface entry and queue visibility, so
    /// the idle decision never races an in-flight enqueue.
    pending_enqueues: AtomicUsize,
}

impl AdmissionQueue {
    pub(crate) fn new(engine_state: EngineState, engine_persistable: bool) -> Self {
        Self {
            state: Mutex::new(ControlState::new(engine_state, engine_persistable)),
            pending_enqueues: AtomicUsize::new(0),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ControlState> {
        self.state.lock()
    }

    pub(crate) fn begin_enqueue(&self) {
        self.pending_enqueues.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn end_enqueue(&self) {
        self.pending_enqueues.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn has_pending_enqueues(&self) -> bool {
        self.pending_enqueues.load(Ordering::SeqCst) > 0
    }

    /// Stamp and either grant the operation immediately (turn free and
    /// predicate satisfied) or park it. While a turn is active, a
    /// preempting operation additionally asks the engine to pause at its
    /// next persistable point.
    pub(crate) fn enqueue(&self, op: &Arc<Operation>, push_front: bool, pause: &PersistPause) {
        let mut state = self.state.lock();
        op.set_stamp(state.counter);
        if !state.busy {
            if state.admissible(op) {
                state.busy = true;
                state.grant(op);
                return;
            }
        } else if op.preempts_engine() {
            pause.request();
        }
        if push_front {
            state.pending.push_front(op.clone());
        } else {
            state.pending.push_back(op.clone());
        }
    }

    /// Remove a parked operation. Failure means a concurrent grant
    /// already dispatched it; removal is the sole arbiter of the
    /// timeout-vs-grant race.
    pub(crate) fn remove(&self, op: &Arc<Operation>) -> bool {
        let mut state = self.state.lock();
        let index = state
            .pending
            .iter()
            .position(|pending| Arc::ptr_eq(pending, op));
        match index {
            Some(index) => {
                state.pending.remove(index);
                true
            }
            None => false,
        }
    }

    /// Wait until the operation is granted the turn, or until the timeout
    /// expires. Exactly one of the two outcomes is observed: on expiry the
    /// operation is removed from the queue, and a failed removal means a
    /// grant won the race and is honored instead.
    pub(crate) async fn wait(&self, op: &Arc<Operation>, timeout: Duration) -> ControlResult<()> {
        match tokio::time::timeout(timeout, op.acquired()).await {
            Ok(()) => Ok(()),
            Err(_) => {
                if self.remove(op) {
                    Err(ControlError::Timeout)
                } else {
                    op.acquired().await;
                    Ok(())
                }
            }
        }
    }
}
