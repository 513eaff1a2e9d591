//! Shared test support: a scripted engine and a counting handler.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use arbor_host::core::pause::PersistPause;
use arbor_host::engine::{
    ActivityCompletion, ActivityEngine, BookmarkInfo, BookmarkResumption, CompletionOutcome,
    EngineFault, EngineState, TrackingRecord,
};
use arbor_host::{
    IdleInfo, InstanceHandler, PersistableIdleAction, UnhandledExceptionAction,
};

/// One step of scripted behavior consumed per engine activation.
#[derive(Debug, Clone)]
pub enum EngineStep {
    CompleteImmediately { outputs: HashMap<String, Value> },
    CreateBookmarkAndIdle { name: String },
    Idle,
}

impl EngineStep {
    pub fn complete() -> Self {
        EngineStep::CompleteImmediately {
            outputs: HashMap::new(),
        }
    }

    pub fn complete_with(outputs: HashMap<String, Value>) -> Self {
        EngineStep::CompleteImmediately { outputs }
    }

    pub fn bookmark(name: &str) -> Self {
        EngineStep::CreateBookmarkAndIdle {
            name: name.to_string(),
        }
    }
}

struct EngineInner {
    state: EngineState,
    persistable: bool,
    script: VecDeque<EngineStep>,
    bookmarks: Vec<BookmarkInfo>,
    completion: Option<CompletionOutcome>,
    cancel_requested: bool,
    termination: Option<String>,
    refuse_resumptions: usize,
    fault_on_run: Option<EngineFault>,
    resumed: Vec<(String, Value)>,
    pending_tracking: Vec<TrackingRecord>,
    tracked: Vec<TrackingRecord>,
}

/// An [`ActivityEngine`] whose activations pop steps off a script.
pub struct ScriptedEngine {
    inner: Arc<Mutex<EngineInner>>,
    abort_calls: Arc<AtomicUsize>,
    terminate_calls: Arc<AtomicUsize>,
    pause: Option<PersistPause>,
}

/// Shared view into a [`ScriptedEngine`] for post-hoc assertions.
#[derive(Clone)]
pub struct EngineProbe {
    inner: Arc<Mutex<EngineInner>>,
    abort_calls: Arc<AtomicUsize>,
    terminate_calls: Arc<AtomicUsize>,
}

impl EngineProbe {
    pub fn abort_count(&self) -> usize {
        self.abort_calls.load(Ordering::SeqCst)
    }

    pub fn terminate_count(&self) -> usize {
        self.terminate_calls.load(Ordering::SeqCst)
    }

    pub fn resumed(&self) -> Vec<(String, Value)> {
        self.inner.lock().resumed.clone()
    }

    pub fn tracked_states(&self) -> Vec<String> {
        self.inner
            .lock()
            .tracked
            .iter()
            .map(|record| record.state.clone())
            .collect()
    }

    pub fn refuse_next_resumptions(&self, count: usize) {
        self.inner.lock().refuse_resumptions = count;
    }

    pub fn fault_next_run(&self, fault: EngineFault) {
        self.inner.lock().fault_on_run = Some(fault);
    }
}

impl ScriptedEngine {
    pub fn new(script: Vec<EngineStep>) -> (Box<dyn ActivityEngine>, EngineProbe) {
        let inner = Arc::new(Mutex::new(EngineInner {
            state: EngineState::Runnable,
            persistable: true,
            script: script.into(),
            bookmarks: Vec::new(),
            completion: None,
            cancel_requested: false,
            termination: None,
            refuse_resumptions: 0,
            fault_on_run: None,
            resumed: Vec::new(),
            pending_tracking: Vec::new(),
            tracked: Vec::new(),
        }));
        let abort_calls = Arc::new(AtomicUsize::new(0));
        let terminate_calls = Arc::new(AtomicUsize::new(0));
        let probe = EngineProbe {
            inner: inner.clone(),
            abort_calls: abort_calls.clone(),
            terminate_calls: terminate_calls.clone(),
        };
        let engine = Box::new(ScriptedEngine {
            inner,
            abort_calls,
            terminate_calls,
            pause: None,
        });
        (engine, probe)
    }
}

#[async_trait]
impl ActivityEngine for ScriptedEngine {
    fn state(&self) -> EngineState {
        self.inner.lock().state
    }

    fn is_persistable(&self) -> bool {
        self.inner.lock().persistable
    }

    fn attach_pause_signal(&mut self, signal: PersistPause) {
        self.pause = Some(signal);
    }

    async fn run(&mut self) -> Result<(), EngineFault> {
        let mut inner = self.inner.lock();
        if let Some(reason) = inner.termination.clone() {
            inner.state = EngineState::Complete;
            inner.persistable = true;
            inner.bookmarks.clear();
            inner.completion = Some(CompletionOutcome {
                completion: ActivityCompletion::Faulted,
                outputs: HashMap::new(),
                fault: Some(EngineFault::new(reason)),
            });
            return Ok(());
        }
        if inner.cancel_requested {
            inner.state = EngineState::Complete;
            inner.persistable = true;
            inner.bookmarks.clear();
            inner.completion = Some(CompletionOutcome {
                completion: ActivityCompletion::Canceled,
                outputs: HashMap::new(),
                fault: None,
            });
            return Ok(());
        }
        if let Some(fault) = inner.fault_on_run.take() {
            inner.state = EngineState::Idle;
            inner.persistable = true;
            return Err(fault);
        }
        match inner.script.pop_front() {
            Some(EngineStep::CompleteImmediately { outputs }) => {
                inner.state = EngineState::Complete;
                inner.persistable = true;
                inner.completion = Some(CompletionOutcome {
                    completion: ActivityCompletion::Closed,
                    outputs,
                    fault: None,
                });
            }
            Some(EngineStep::CreateBookmarkAndIdle { name }) => {
                inner.bookmarks.push(BookmarkInfo::new(name));
                inner.state = EngineState::Idle;
                inner.persistable = true;
            }
            Some(EngineStep::Idle) | None => {
                inner.state = EngineState::Idle;
                inner.persistable = true;
            }
        }
        Ok(())
    }

    async fn abort(&mut self, _reason: &str) {
        self.abort_calls.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.inner.lock();
        inner.persistable = false;
    }

    async fn terminate(&mut self, reason: &str) {
        self.terminate_calls.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.inner.lock();
        inner.termination = Some(reason.to_string());
        inner.state = EngineState::Runnable;
    }

    fn schedule_cancel(&mut self) {
        let mut inner = self.inner.lock();
        inner.cancel_requested = true;
        inner.state = EngineState::Runnable;
    }

    fn schedule_bookmark_resumption(&mut self, name: &str, value: Value) -> BookmarkResumption {
        let mut inner = self.inner.lock();
        let Some(index) = inner.bookmarks.iter().position(|b| b.name == name) else {
            return BookmarkResumption::NotFound;
        };
        if inner.refuse_resumptions > 0 {
            inner.refuse_resumptions -= 1;
            return BookmarkResumption::NotReady;
        }
        inner.bookmarks.remove(index);
        inner.resumed.push((name.to_string(), value));
        inner.state = EngineState::Runnable;
        BookmarkResumption::Success
    }

    fn bookmarks(&self) -> Vec<BookmarkInfo> {
        self.inner.lock().bookmarks.clone()
    }

    fn completion_state(&self) -> Option<CompletionOutcome> {
        self.inner.lock().completion.clone()
    }

    fn track(&mut self, record: TrackingRecord) {
        self.inner.lock().pending_tracking.push(record);
    }

    fn has_pending_tracking(&self) -> bool {
        !self.inner.lock().pending_tracking.is_empty()
    }

    async fn flush_tracking(&mut self, _timeout: Duration) -> Result<(), EngineFault> {
        let mut inner = self.inner.lock();
        let pending = std::mem::take(&mut inner.pending_tracking);
        inner.tracked.extend(pending);
        Ok(())
    }

    fn prepare_for_serialization(&mut self) -> Result<Value, EngineFault> {
        let inner = self.inner.lock();
        let status = match inner.state {
            EngineState::Idle => "idle",
            EngineState::Runnable => "runnable",
            EngineState::Complete => "complete",
        };
        let names: Vec<&str> = inner.bookmarks.iter().map(|b| b.name.as_str()).collect();
        Ok(json!({ "status": status, "bookmarks": names }))
    }

    fn hydrate(&mut self, state: Value) -> Result<(), EngineFault> {
        let mut inner = self.inner.lock();
        let status = state
            .get("status")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineFault::new("malformed engine snapshot"))?;
        inner.state = match status {
            "idle" => EngineState::Idle,
            "runnable" => EngineState::Runnable,
            "complete" => EngineState::Complete,
            other => return Err(EngineFault::new(format!("unknown status '{}'", other))),
        };
        inner.bookmarks = state
            .get("bookmarks")
            .and_then(Value::as_array)
            .map(|names| {
                names
                    .iter()
                    .filter_map(Value::as_str)
                    .map(BookmarkInfo::new)
                    .collect()
            })
            .unwrap_or_default();
        inner.persistable = true;
        Ok(())
    }
}

/// Handler that counts every notification and returns configured actions.
pub struct CountingHandler {
    pub idle: AtomicUsize,
    pub persistable_idle: AtomicUsize,
    pub completed: AtomicUsize,
    pub aborted: AtomicUsize,
    pub unloaded: AtomicUsize,
    pub exceptions: AtomicUsize,
    pub idle_action: PersistableIdleAction,
    pub exception_action: UnhandledExceptionAction,
    pub last_completion: Mutex<Option<CompletionOutcome>>,
}

impl CountingHandler {
    pub fn new() -> Arc<Self> {
        Self::with_actions(
            PersistableIdleAction::None,
            UnhandledExceptionAction::Terminate,
        )
    }

    pub fn with_actions(
        idle_action: PersistableIdleAction,
        exception_action: UnhandledExceptionAction,
    ) -> Arc<Self> {
        Arc::new(Self {
            idle: AtomicUsize::new(0),
            persistable_idle: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            aborted: AtomicUsize::new(0),
            unloaded: AtomicUsize::new(0),
            exceptions: AtomicUsize::new(0),
            idle_action,
            exception_action,
            last_completion: Mutex::new(None),
        })
    }

    pub fn idle_count(&self) -> usize {
        self.idle.load(Ordering::SeqCst)
    }

    pub fn completed_count(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn aborted_count(&self) -> usize {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn unloaded_count(&self) -> usize {
        self.unloaded.load(Ordering::SeqCst)
    }

    pub fn exception_count(&self) -> usize {
        self.exceptions.load(Ordering::SeqCst)
    }

    pub fn last_completion(&self) -> Option<CompletionOutcome> {
        self.last_completion.lock().clone()
    }
}

#[async_trait]
impl InstanceHandler for CountingHandler {
    async fn on_idle(&self, _info: &IdleInfo) {
        self.idle.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_persistable_idle(&self, _info: &IdleInfo) -> PersistableIdleAction {
        self.persistable_idle.fetch_add(1, Ordering::SeqCst);
        self.idle_action
    }

    async fn on_completed(&self, outcome: &CompletionOutcome) {
        self.completed.fetch_add(1, Ordering::SeqCst);
        *self.last_completion.lock() = Some(outcome.clone());
    }

    async fn on_unhandled_exception(&self, _fault: &EngineFault) -> UnhandledExceptionAction {
        self.exceptions.fetch_add(1, Ordering::SeqCst);
        self.exception_action
    }

    async fn on_aborted(&self, _reason: &str) {
        self.aborted.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_unloaded(&self) {
        self.unloaded.fetch_add(1, Ordering::SeqCst);
    }
}
