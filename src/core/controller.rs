//! The instance controller — the host-facing control core.
//!
//! [`InstanceController`] wraps one engine instance and exposes the
//! mutually-exclusive control operations (run, cancel, terminate, persist,
//! unload, bookmark resumption, load, abort) to arbitrary concurrent
//! callers. Every host call wraps its intent as an
//! [`Operation`](super::operation::Operation), the admission queue runs it
//! now or parks it, and the turn scheduler decides after every engine
//! suspension whether to dispatch pending work, raise idle, raise
//! completion, or go dormant.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::mpsc;

use super::admission::AdmissionQueue;
use super::events::{
    EventEmitter, IdleInfo, InstanceEvent, InstanceHandler, NoopHandler, PersistableIdleAction,
    UnhandledExceptionAction,
};
use super::lifecycle::InstanceLifecycle;
use super::operation::{Operation, OperationKind};
use super::pause::PersistPause;
use super::persistence::PersistKind;
use crate::engine::{
    ActivityCompletion, ActivityEngine, BookmarkInfo, BookmarkResumption, CompletionOutcome,
    EngineFault, EngineState, TrackingRecord,
};
use crate::error::{ControlError, ControlResult};
use crate::pipeline::PersistencePipeline;
use crate::store::{InstanceId, InstanceStore, OwnerId, StoreHandle};

/// Configuration for the control core.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct HostConfig {
    /// Fixed timeout for idle-triggered persistence, distinct from caller
    /// timeouts so it never blocks the turn indefinitely.
    #[serde(default = "default_internal_persist_timeout_secs")]
    pub internal_persist_timeout_secs: u64,
    #[serde(default = "default_tracking_flush_timeout_secs")]
    pub tracking_flush_timeout_secs: u64,
}

fn default_internal_persist_timeout_secs() -> u64 {
    30
}

fn default_tracking_flush_timeout_secs() -> u64 {
    30
}

impl Default for HostConfig {
    fn default() -> Self {
        HostConfig {
            internal_persist_timeout_secs: default_internal_persist_timeout_secs(),
            tracking_flush_timeout_secs: default_tracking_flush_timeout_secs(),
        }
    }
}

/// Collaborators and configuration handed to [`InstanceController::new`].
pub struct InstanceOptions {
    pub handler: Arc<dyn InstanceHandler>,
    pub store: Option<Arc<dyn InstanceStore>>,
    pub pipeline: Option<Arc<dyn PersistencePipeline>>,
    pub config: HostConfig,
    pub owner: OwnerId,
    pub event_tx: Option<mpsc::Sender<InstanceEvent>>,
}

impl Default for InstanceOptions {
    fn default() -> Self {
        Self {
            handler: Arc::new(NoopHandler),
            store: None,
            pipeline: None,
            config: HostConfig::default(),
            owner: OwnerId::generate(),
            event_tx: None,
        }
    }
}

pub(crate) struct StoreSession {
    pub(crate) handle: StoreHandle,
    /// Governs deletion on terminal persistence: only an identity this
    /// core created is deleted on completion.
    pub(crate) created_identity: bool,
}

/// The single "pipeline in use" slot. The abort path consults `in_use`
/// to decide whether a foreign-task `abort` must interrupt a stage.
pub(crate) struct PipelineSlot {
    pub(crate) pipeline: Arc<dyn PersistencePipeline>,
    pub(crate) in_use: AtomicBool,
}

enum TurnAction {
    RaiseCompleted,
    Dispatch,
    RunEngine,
    RaiseIdle,
    Dormant,
}

pub(crate) struct ControllerInner {
    pub(crate) queue: AdmissionQueue,
    pub(crate) engine: tokio::sync::Mutex<Box<dyn ActivityEngine>>,
    pub(crate) handler: Arc<dyn InstanceHandler>,
    pub(crate) emitter: EventEmitter,
    pub(crate) store: Option<Arc<dyn InstanceStore>>,
    pub(crate) pipeline: Option<PipelineSlot>,
    pub(crate) session: tokio::sync::Mutex<Option<StoreSession>>,
    pub(crate) pause: PersistPause,
    pub(crate) config: HostConfig,
    pub(crate) owner: OwnerId,
}

/// Host-facing control core for one workflow instance.
///
/// Cloning shares the underlying instance; all methods may be called
/// concurrently from any task.
#[derive(Clone)]
pub struct InstanceController {
    inner: Arc<ControllerInner>,
}

impl InstanceController {
    pub fn new(mut engine: Box<dyn ActivityEngine>, options: InstanceOptions) -> Self {
        let pause = PersistPause::new();
        engine.attach_pause_signal(pause.clone());
        let queue = AdmissionQueue::new(engine.state(), engine.is_persistable());
        let inner = ControllerInner {
            queue,
            engine: tokio::sync::Mutex::new(engine),
            handler: options.handler,
            emitter: EventEmitter::new(options.event_tx),
            store: options.store,
            pipeline: options.pipeline.map(|pipeline| PipelineSlot {
                pipeline,
                in_use: AtomicBool::new(false),
            }),
            session: tokio::sync::Mutex::new(None),
            pause,
            config: options.config,
            owner: options.owner,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Authorize execution; returns once the instance has gone idle,
    /// completed, or handed the turn to another pending operation.
    pub async fn run(&self, timeout: Duration) -> ControlResult<()> {
        self.inner.run_operation(timeout).await
    }

    /// Schedule cancellation of the root activity and drive it.
    pub async fn cancel(&self, timeout: Duration) -> ControlResult<()> {
        let inner = &self.inner;
        let op = Operation::new(OperationKind::Generic, false, true);
        inner.admit(&op, false, timeout).await?;
        let check = inner.check_operable();
        let result = match check {
            Ok(()) => {
                {
                    let mut engine = inner.engine.lock().await;
                    engine.schedule_cancel();
                    inner.refresh_mirror(&**engine);
                }
                let mut state = inner.queue.lock();
                state.lifecycle = InstanceLifecycle::Runnable;
                state.has_started = true;
                Ok(())
            }
            Err(e) => Err(e),
        };
        inner.finish_operation(result).await
    }

    /// Terminate the instance with a reason; the root completes Faulted.
    /// Idempotent: once a reason is recorded, later calls succeed without
    /// recording another.
    pub async fn terminate(
        &self,
        reason: impl Into<String>,
        timeout: Duration,
    ) -> ControlResult<()> {
        let reason = reason.into();
        let inner = &self.inner;
        let op = Operation::new(OperationKind::Generic, false, true);
        inner.admit(&op, false, timeout).await?;

        enum Disposition {
            AlreadyTerminated,
            Proceed,
            Reject(ControlError),
        }
        let disposition = {
            let mut state = inner.queue.lock();
            match state.lifecycle {
                InstanceLifecycle::Aborted => Disposition::Reject(ControlError::Aborted(
                    state.abort_reason.clone().unwrap_or_default(),
                )),
                InstanceLifecycle::Unloaded => Disposition::Reject(ControlError::Unloaded),
                _ if state.termination_reason.is_some() => Disposition::AlreadyTerminated,
                _ if state.completion_raised => {
                    Disposition::Reject(ControlError::TerminatedOrCompleted)
                }
                _ => {
                    state.termination_reason = Some(reason.clone());
                    Disposition::Proceed
                }
            }
        };
        let result = match disposition {
            Disposition::AlreadyTerminated => Ok(()),
            Disposition::Reject(e) => Err(e),
            Disposition::Proceed => {
                {
                    let mut engine = inner.engine.lock().await;
                    engine.terminate(&reason).await;
                    inner.refresh_mirror(&**engine);
                }
                let mut state = inner.queue.lock();
                state.lifecycle = InstanceLifecycle::Runnable;
                state.has_started = true;
                Ok(())
            }
        };
        inner.finish_operation(result).await
    }

    /// Checkpoint the instance, retaining the durable lock.
    pub async fn persist(&self, timeout: Duration) -> ControlResult<()> {
        self.inner
            .persist_with_admission(PersistKind::Save, timeout)
            .await
    }

    /// Checkpoint the instance and unload it, releasing the durable lock.
    pub async fn unload(&self, timeout: Duration) -> ControlResult<()> {
        self.inner
            .persist_with_admission(PersistKind::Unload, timeout)
            .await
    }

    /// Resume a named suspension point, retrying while the engine reports
    /// it is not yet ready to accept the resumption.
    pub async fn resume_bookmark(
        &self,
        name: &str,
        value: Value,
        timeout: Duration,
    ) -> ControlResult<BookmarkResumption> {
        self.inner.resume_bookmark(name, value, timeout).await
    }

    /// Snapshot the engine's current bookmarks.
    pub async fn bookmarks(&self, timeout: Duration) -> ControlResult<Vec<BookmarkInfo>> {
        let inner = &self.inner;
        let op = Operation::new(OperationKind::Generic, false, true);
        inner.admit(&op, false, timeout).await?;
        let result = match inner.check_not_torn_down() {
            Ok(()) => {
                let engine = inner.engine.lock().await;
                Ok(engine.bookmarks())
            }
            Err(e) => Err(e),
        };
        inner.finish_operation(result).await
    }

    /// Bind a stored instance identity and rebuild the engine from its
    /// snapshot. Valid only before the first run.
    pub async fn load(&self, instance: InstanceId, timeout: Duration) -> ControlResult<()> {
        self.inner
            .load_operation(Some(instance), timeout)
            .await
            .map(|_| ())
    }

    /// Find, lock, and load any runnable instance from the store. Returns
    /// `None` when the store has nothing runnable.
    pub async fn load_runnable(&self, timeout: Duration) -> ControlResult<Option<InstanceId>> {
        self.inner.load_operation(None, timeout).await
    }

    /// Rebuild the engine from an in-memory snapshot without touching the
    /// store. Valid only before the first run.
    pub async fn load_snapshot(
        &self,
        snapshot: crate::snapshot::InstanceSnapshot,
        timeout: Duration,
    ) -> ControlResult<()> {
        self.inner.load_snapshot_operation(snapshot, timeout).await
    }

    /// Tear the instance down. Safe to call from any task at any time;
    /// idempotent, and the engine's own abort runs exactly once.
    pub async fn abort(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let inner = &self.inner;
        let claimed = {
            let mut state = inner.queue.lock();
            if state.has_aborted {
                false
            } else {
                state.has_aborted = true;
                state.abort_reason = Some(reason.clone());
                true
            }
        };
        if !claimed {
            return;
        }
        // The engine is unsafe to touch while a turn is active: win a
        // high-priority, front-of-queue operation first.
        let op = Operation::new(OperationKind::Generic, true, false);
        inner.queue.begin_enqueue();
        inner.queue.enqueue(&op, true, &inner.pause);
        inner.queue.end_enqueue();
        op.acquired().await;
        inner.abort_core(&reason).await;
        inner.run_turn_loop().await;
    }

    /// Current coarse lifecycle.
    pub fn lifecycle(&self) -> InstanceLifecycle {
        self.inner.queue.lock().lifecycle
    }

    /// Terminal outcome, available once completion has been raised.
    pub fn completion_outcome(&self) -> Option<CompletionOutcome> {
        self.inner.queue.lock().completion.clone()
    }

    /// The recorded termination reason, if any.
    pub fn termination_reason(&self) -> Option<String> {
        self.inner.queue.lock().termination_reason.clone()
    }

    /// Durable identity bound to this instance, once one exists.
    pub async fn durable_identity(&self) -> Option<InstanceId> {
        self.inner
            .session
            .lock()
            .await
            .as_ref()
            .map(|session| session.handle.instance)
    }
}

impl ControllerInner {
    /// Park the calling task until the operation holds the turn.
    pub(crate) async fn admit(
        &self,
        op: &Arc<Operation>,
        push_front: bool,
        timeout: Duration,
    ) -> ControlResult<()> {
        self.queue.begin_enqueue();
        self.queue.enqueue(op, push_front, &self.pause);
        self.queue.end_enqueue();
        self.queue.wait(op, timeout).await
    }

    /// Convert an internal failure into an instance abort, then release
    /// the turn. Every granted operation body funnels through here.
    pub(crate) async fn finish_operation<T>(&self, result: ControlResult<T>) -> ControlResult<T> {
        if let Err(e) = &result {
            if e.aborts_instance() {
                self.abort_holding_turn(&e.to_string()).await;
            }
        }
        self.run_turn_loop().await;
        result
    }

    pub(crate) fn check_operable(&self) -> ControlResult<()> {
        let state = self.queue.lock();
        match state.lifecycle {
            InstanceLifecycle::Aborted => Err(ControlError::Aborted(
                state.abort_reason.clone().unwrap_or_default(),
            )),
            InstanceLifecycle::Unloaded => Err(ControlError::Unloaded),
            _ if state.completion_raised => Err(ControlError::TerminatedOrCompleted),
            _ => Ok(()),
        }
    }

    /// Like [`check_operable`](Self::check_operable) but tolerates a
    /// completed instance, for read-only observations.
    pub(crate) fn check_not_torn_down(&self) -> ControlResult<()> {
        let state = self.queue.lock();
        match state.lifecycle {
            InstanceLifecycle::Aborted => Err(ControlError::Aborted(
                state.abort_reason.clone().unwrap_or_default(),
            )),
            InstanceLifecycle::Unloaded => Err(ControlError::Unloaded),
            _ => Ok(()),
        }
    }

    pub(crate) async fn run_operation(&self, timeout: Duration) -> ControlResult<()> {
        let op = Operation::new(OperationKind::Generic, false, true);
        self.admit(&op, false, timeout).await?;
        let result = match self.check_operable() {
            Ok(()) => {
                let mut state = self.queue.lock();
                state.lifecycle = InstanceLifecycle::Runnable;
                state.has_started = true;
                Ok(())
            }
            Err(e) => Err(e),
        };
        self.finish_operation(result).await
    }

    /// Refresh the engine-state mirror consulted by admissibility
    /// predicates. Caller holds the engine lock (and therefore the turn).
    pub(crate) fn refresh_mirror(&self, engine: &dyn ActivityEngine) {
        let engine_state = engine.state();
        let persistable = engine.is_persistable();
        let mut state = self.queue.lock();
        state.engine_state = engine_state;
        state.engine_persistable = persistable;
    }

    /// The decision loop run whenever the turn is released: raise
    /// completion, dispatch the next operation, re-invoke the engine,
    /// raise idle, or go dormant. A loop rather than recursion so long
    /// chains of synchronous completions don't grow the call stack.
    pub(crate) async fn run_turn_loop(&self) {
        loop {
            let action = {
                let mut state = self.queue.lock();
                debug_assert!(state.busy, "turn loop entered without the turn");
                if state.engine_state == EngineState::Complete
                    && !state.completion_raised
                    && !state.lifecycle.is_terminal()
                {
                    state.completion_raised = true;
                    TurnAction::RaiseCompleted
                } else if state.find_next().is_some() {
                    TurnAction::Dispatch
                } else if state.engine_state == EngineState::Runnable
                    && state.lifecycle == InstanceLifecycle::Runnable
                {
                    state.executed_since_idle = true;
                    TurnAction::RunEngine
                } else if state.executed_since_idle
                    && matches!(
                        state.engine_state,
                        EngineState::Idle | EngineState::Complete
                    )
                    && !state.completion_raised
                    && !state.lifecycle.is_terminal()
                    && !self.queue.has_pending_enqueues()
                {
                    state.executed_since_idle = false;
                    TurnAction::RaiseIdle
                } else {
                    state.busy = false;
                    TurnAction::Dormant
                }
            };
            match action {
                // The granted operation's continuation releases the turn
                // when its body finishes.
                TurnAction::Dispatch => return,
                TurnAction::Dormant => return,
                TurnAction::RunEngine => self.invoke_engine().await,
                TurnAction::RaiseIdle => self.raise_idle().await,
                TurnAction::RaiseCompleted => self.raise_completed().await,
            }
        }
    }

    async fn invoke_engine(&self) {
        let run_result = {
            let mut engine = self.engine.lock().await;
            let result = engine.run().await;
            self.refresh_mirror(&**engine);
            result
        };
        if let Err(fault) = run_result {
            self.handle_engine_fault(fault).await;
        }
    }

    async fn handle_engine_fault(&self, fault: EngineFault) {
        tracing::warn!("unhandled workflow exception: {}", fault);
        self.emitter
            .emit(InstanceEvent::UnhandledException {
                message: fault.message.clone(),
                source_activity: fault.source_activity.clone(),
                timestamp: Utc::now(),
            })
            .await;
        match self.handler.on_unhandled_exception(&fault).await {
            UnhandledExceptionAction::Abort => {
                self.abort_holding_turn(&fault.message).await;
            }
            UnhandledExceptionAction::Cancel => {
                {
                    let mut engine = self.engine.lock().await;
                    engine.schedule_cancel();
                    self.refresh_mirror(&**engine);
                }
                let mut state = self.queue.lock();
                state.lifecycle = InstanceLifecycle::Runnable;
            }
            UnhandledExceptionAction::Terminate => {
                {
                    let mut state = self.queue.lock();
                    if state.termination_reason.is_none() {
                        state.termination_reason = Some(fault.message.clone());
                    }
                }
                {
                    let mut engine = self.engine.lock().await;
                    engine.terminate(&fault.message).await;
                    self.refresh_mirror(&**engine);
                }
                let mut state = self.queue.lock();
                state.lifecycle = InstanceLifecycle::Runnable;
            }
        }
    }

    async fn raise_idle(&self) {
        if let Err(e) = self.flush_tracking(TrackingRecord::new("idle")).await {
            self.abort_holding_turn(&e.to_string()).await;
            return;
        }
        let bookmarks = {
            let engine = self.engine.lock().await;
            engine.bookmarks()
        };
        self.emitter
            .emit(InstanceEvent::Idle {
                bookmarks: bookmarks.clone(),
                timestamp: Utc::now(),
            })
            .await;
        let info = IdleInfo { bookmarks };
        self.handler.on_idle(&info).await;

        let persistable = { self.queue.lock().engine_persistable };
        if !persistable || (self.store.is_none() && self.pipeline.is_none()) {
            return;
        }
        let kind = match self.handler.on_persistable_idle(&info).await {
            PersistableIdleAction::None => return,
            PersistableIdleAction::Persist => PersistKind::Save,
            PersistableIdleAction::Unload => PersistKind::Unload,
        };
        let timeout = Duration::from_secs(self.config.internal_persist_timeout_secs);
        if let Err(e) = self.persist_holding_turn(kind, timeout).await {
            if e.aborts_instance() {
                self.abort_holding_turn(&e.to_string()).await;
            } else {
                tracing::warn!("idle-triggered persistence failed: {}", e);
            }
        }
    }

    async fn raise_completed(&self) {
        if let Err(e) = self.flush_tracking(TrackingRecord::new("completed")).await {
            self.abort_holding_turn(&e.to_string()).await;
            return;
        }
        let outcome = {
            let engine = self.engine.lock().await;
            engine.completion_state()
        };
        let outcome = outcome.unwrap_or(CompletionOutcome {
            completion: ActivityCompletion::Closed,
            outputs: HashMap::new(),
            fault: None,
        });
        {
            self.queue.lock().completion = Some(outcome.clone());
        }
        // Implicit unload-persist when durable components are configured.
        if self.store.is_some() || self.pipeline.is_some() {
            let timeout = Duration::from_secs(self.config.internal_persist_timeout_secs);
            if let Err(e) = self.persist_holding_turn(PersistKind::Complete, timeout).await {
                tracing::warn!("completion persistence failed: {}", e);
            }
        }
        self.emitter
            .emit(InstanceEvent::Completed {
                completion: outcome.completion,
                timestamp: Utc::now(),
            })
            .await;
        self.handler.on_completed(&outcome).await;
    }

    /// Abort while already holding the turn (internal failures, handler
    /// decisions). The has-aborted flag makes the engine teardown run
    /// exactly once no matter how many paths race here.
    pub(crate) async fn abort_holding_turn(&self, reason: &str) {
        let claimed = {
            let mut state = self.queue.lock();
            if state.has_aborted {
                false
            } else {
                state.has_aborted = true;
                state.abort_reason = Some(reason.to_string());
                true
            }
        };
        if claimed {
            self.abort_core(reason).await;
        }
    }

    /// The actual teardown; caller holds the turn and has claimed the
    /// has-aborted flag.
    pub(crate) async fn abort_core(&self, reason: &str) {
        {
            self.queue.lock().lifecycle = InstanceLifecycle::Aborted;
        }
        if let Some(slot) = &self.pipeline {
            if slot.in_use.load(Ordering::Acquire) {
                slot.pipeline.abort();
            }
        }
        {
            let mut engine = self.engine.lock().await;
            engine.abort(reason).await;
            self.refresh_mirror(&**engine);
        }
        if let Err(e) = self.flush_tracking(TrackingRecord::new("aborted")).await {
            tracing::warn!("tracking flush during abort failed: {}", e);
        }
        self.emitter
            .emit(InstanceEvent::Aborted {
                reason: reason.to_string(),
                timestamp: Utc::now(),
            })
            .await;
        self.handler.on_aborted(reason).await;
    }

    pub(crate) async fn flush_tracking(&self, record: TrackingRecord) -> ControlResult<()> {
        let timeout = Duration::from_secs(self.config.tracking_flush_timeout_secs);
        let mut engine = self.engine.lock().await;
        engine.track(record);
        if engine.has_pending_tracking() {
            engine
                .flush_tracking(timeout)
                .await
                .map_err(|e| ControlError::Engine(e.to_string()))?;
        }
        Ok(())
    }
}
