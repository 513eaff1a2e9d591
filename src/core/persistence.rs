//! The persistence sequencer: collect → map → save → unlock/delete,
//! ordered so a crash at any point leaves the store consistent, plus the
//! load-side inverse.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;

use super::controller::{ControllerInner, StoreSession};
use super::events::InstanceEvent;
use super::lifecycle::InstanceLifecycle;
use super::operation::{Operation, OperationKind};
use crate::engine::{EngineState, TrackingRecord};
use crate::error::{ControlError, ControlResult, StoreError};
use crate::snapshot::{FaultInfo, InstanceSnapshot, InstanceStatus};
use crate::store::{InstanceId, StoreCommand, StoreHandle};

/// What a persistence episode is for. `Save` retains the durable lock;
/// `Unload` and `Complete` release it, and `Complete` additionally
/// deletes the identity when this core created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistKind {
    Save,
    Unload,
    Complete,
}

impl PersistKind {
    fn tracking_state(&self) -> &'static str {
        match self {
            PersistKind::Save => "persisted",
            PersistKind::Unload => "unloaded",
            PersistKind::Complete => "completed",
        }
    }
}

impl ControllerInner {
    /// Host-initiated persistence: wins a persistence-admitting operation
    /// first, which also prevents concurrent persistence attempts.
    pub(crate) async fn persist_with_admission(
        &self,
        kind: PersistKind,
        timeout: Duration,
    ) -> ControlResult<()> {
        let op = Operation::new(OperationKind::RequiresPersistable, true, true);
        self.admit(&op, false, timeout).await?;
        self.pause.clear();
        let precheck = {
            let state = self.queue.lock();
            match state.lifecycle {
                InstanceLifecycle::Aborted => Err(ControlError::Aborted(
                    state.abort_reason.clone().unwrap_or_default(),
                )),
                InstanceLifecycle::Unloaded => Err(ControlError::Unloaded),
                _ if kind == PersistKind::Save && state.completion_raised => {
                    Err(ControlError::TerminatedOrCompleted)
                }
                _ => Ok(()),
            }
        };
        let result = match precheck {
            Ok(()) => self.persist_holding_turn(kind, timeout).await,
            Err(e) => Err(e),
        };
        self.finish_operation(result).await
    }

    /// Run one persistence episode while holding the turn. Components
    /// that are absent trivially succeed and the sequence advances.
    pub(crate) async fn persist_holding_turn(
        &self,
        kind: PersistKind,
        timeout: Duration,
    ) -> ControlResult<()> {
        self.flush_tracking(TrackingRecord::new(kind.tracking_state()))
            .await?;

        let variables = match &self.pipeline {
            Some(slot) => {
                self.check_pipeline_usable()?;
                slot.in_use.store(true, Ordering::Release);
                let staged = async {
                    slot.pipeline.collect().await?;
                    slot.pipeline.map().await?;
                    Ok::<_, crate::error::PipelineError>(slot.pipeline.values())
                }
                .await;
                match staged {
                    Ok(values) => values,
                    Err(e) => {
                        slot.in_use.store(false, Ordering::Release);
                        return Err(e.into());
                    }
                }
            }
            None => HashMap::new(),
        };

        let saved = self.save_to_store(kind, variables, timeout).await;
        if let Err(e) = saved {
            if let Some(slot) = &self.pipeline {
                slot.in_use.store(false, Ordering::Release);
            }
            return Err(e);
        }

        if let Some(slot) = &self.pipeline {
            let staged = async {
                slot.pipeline.save(timeout).await?;
                slot.pipeline.publish().await
            }
            .await;
            slot.in_use.store(false, Ordering::Release);
            staged?;
        }

        if kind == PersistKind::Complete {
            self.delete_created_identity(timeout).await;
        }

        self.emitter
            .emit(InstanceEvent::Persisted {
                kind,
                timestamp: Utc::now(),
            })
            .await;

        if kind != PersistKind::Save {
            {
                let mut state = self.queue.lock();
                if !state.lifecycle.is_terminal() {
                    state.lifecycle = InstanceLifecycle::Unloaded;
                }
            }
            if let Some(store) = &self.store {
                let mut session = self.session.lock().await;
                if let Some(session) = session.take() {
                    store.free(&session.handle).await;
                }
            }
            self.emitter
                .emit(InstanceEvent::Unloaded {
                    timestamp: Utc::now(),
                })
                .await;
            self.handler.on_unloaded().await;
        }
        Ok(())
    }

    async fn save_to_store(
        &self,
        kind: PersistKind,
        variables: HashMap<String, Value>,
        timeout: Duration,
    ) -> ControlResult<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let handle = self.ensure_store_session(timeout).await?;
        let snapshot = self.build_snapshot(variables).await?;
        let (complete, unlock) = match kind {
            PersistKind::Save => (false, false),
            PersistKind::Unload => (false, true),
            PersistKind::Complete => (true, true),
        };
        store
            .execute(
                &handle,
                StoreCommand::Save {
                    snapshot,
                    complete,
                    unlock,
                },
                timeout,
            )
            .await?;
        Ok(())
    }

    /// Best-effort deletion of a durable identity this core created.
    /// Failures never fail the persistence episode.
    async fn delete_created_identity(&self, timeout: Duration) {
        let Some(store) = &self.store else {
            return;
        };
        let session = self.session.lock().await;
        let Some(session) = session.as_ref() else {
            return;
        };
        if !session.created_identity {
            return;
        }
        if let Err(e) = store
            .execute(&session.handle, StoreCommand::DeleteInstance, timeout)
            .await
        {
            if e.is_ignorable_cleanup_failure() {
                tracing::debug!("instance cleanup already satisfied: {}", e);
            } else {
                tracing::warn!("best-effort instance deletion failed: {}", e);
            }
        }
    }

    /// Lazily bind the durable-store identity on first use.
    pub(crate) async fn ensure_store_session(
        &self,
        timeout: Duration,
    ) -> ControlResult<StoreHandle> {
        let Some(store) = &self.store else {
            return Err(ControlError::NoStore);
        };
        let mut session = self.session.lock().await;
        if let Some(existing) = session.as_ref() {
            return Ok(existing.handle.clone());
        }
        let handle = store.create_handle(self.owner, None).await?;
        store
            .execute(&handle, StoreCommand::CreateInstance, timeout)
            .await?;
        *session = Some(StoreSession {
            handle: handle.clone(),
            created_identity: true,
        });
        Ok(handle)
    }

    pub(crate) fn check_pipeline_usable(&self) -> ControlResult<()> {
        let state = self.queue.lock();
        if state.lifecycle == InstanceLifecycle::Aborted {
            return Err(ControlError::Aborted(
                state.abort_reason.clone().unwrap_or_default(),
            ));
        }
        Ok(())
    }

    async fn build_snapshot(
        &self,
        variables: HashMap<String, Value>,
    ) -> ControlResult<InstanceSnapshot> {
        let (engine_state_value, bookmarks, engine_state, outcome) = {
            let mut engine = self.engine.lock().await;
            let value = engine
                .prepare_for_serialization()
                .map_err(|e| ControlError::Engine(e.to_string()))?;
            (
                value,
                engine.bookmarks(),
                engine.state(),
                engine.completion_state(),
            )
        };
        let status = match engine_state {
            EngineState::Complete => InstanceStatus::Completed,
            EngineState::Idle => InstanceStatus::Idle,
            EngineState::Runnable => InstanceStatus::Running,
        };
        let (outputs, fault) = match (status, outcome) {
            (InstanceStatus::Completed, Some(outcome)) => (
                Some(outcome.outputs),
                outcome.fault.as_ref().map(FaultInfo::from),
            ),
            _ => (None, None),
        };
        Ok(InstanceSnapshot {
            engine_state: engine_state_value,
            status,
            bookmarks,
            variables,
            outputs,
            fault,
            saved_at: Utc::now().timestamp(),
        })
    }

    pub(crate) async fn load_operation(
        &self,
        instance: Option<InstanceId>,
        timeout: Duration,
    ) -> ControlResult<Option<InstanceId>> {
        let op = Operation::new(OperationKind::Generic, false, false);
        self.admit(&op, false, timeout).await?;
        let result = self.load_body(instance, timeout).await;
        self.finish_operation(result).await
    }

    async fn load_body(
        &self,
        instance: Option<InstanceId>,
        timeout: Duration,
    ) -> ControlResult<Option<InstanceId>> {
        self.check_loadable()?;
        let Some(store) = &self.store else {
            return Err(ControlError::NoStore);
        };
        {
            let session = self.session.lock().await;
            if session.is_some() {
                return Err(ControlError::AlreadyHasIdentity);
            }
        }
        let handle = store.create_handle(self.owner, instance).await?;
        let command = match instance {
            Some(_) => StoreCommand::Load,
            None => StoreCommand::TryLoadRunnable,
        };
        let view = store.execute(&handle, command, timeout).await?;
        let Some(snapshot) = view.snapshot else {
            return match instance {
                Some(id) => Err(ControlError::Store(StoreError::NotFound(id))),
                None => Ok(None),
            };
        };
        // TryLoadRunnable picks the instance; rebind the handle to it.
        let handle = StoreHandle {
            owner: handle.owner,
            instance: view.instance,
        };
        self.apply_snapshot(&snapshot, timeout).await?;
        {
            let mut session = self.session.lock().await;
            *session = Some(StoreSession {
                handle,
                created_identity: false,
            });
        }
        Ok(Some(view.instance))
    }

    pub(crate) async fn load_snapshot_operation(
        &self,
        snapshot: InstanceSnapshot,
        timeout: Duration,
    ) -> ControlResult<()> {
        let op = Operation::new(OperationKind::Generic, false, false);
        self.admit(&op, false, timeout).await?;
        let result = match self.check_loadable() {
            Ok(()) => self.apply_snapshot(&snapshot, timeout).await,
            Err(e) => Err(e),
        };
        self.finish_operation(result).await
    }

    fn check_loadable(&self) -> ControlResult<()> {
        let state = self.queue.lock();
        match state.lifecycle {
            InstanceLifecycle::Aborted => Err(ControlError::Aborted(
                state.abort_reason.clone().unwrap_or_default(),
            )),
            InstanceLifecycle::Unloaded => Err(ControlError::Unloaded),
            // Any prior initializing operation makes a load too late.
            _ if state.has_started || state.initialized => Err(ControlError::AlreadyHasIdentity),
            _ => Ok(()),
        }
    }

    /// Rebuild the live instance from a snapshot: pipeline first, then the
    /// engine, then the completion-raised flag so reload never re-raises.
    async fn apply_snapshot(
        &self,
        snapshot: &InstanceSnapshot,
        timeout: Duration,
    ) -> ControlResult<()> {
        if let Some(slot) = &self.pipeline {
            self.check_pipeline_usable()?;
            slot.in_use.store(true, Ordering::Release);
            let staged = slot.pipeline.load(timeout).await;
            slot.in_use.store(false, Ordering::Release);
            staged?;
            slot.pipeline.set_loaded_values(snapshot.variables.clone());
        }
        {
            let mut engine = self.engine.lock().await;
            engine
                .hydrate(snapshot.engine_state.clone())
                .map_err(|e| ControlError::Engine(e.to_string()))?;
            self.refresh_mirror(&**engine);
        }
        let mut state = self.queue.lock();
        if snapshot.is_completed() {
            state.completion_raised = true;
        }
        Ok(())
    }
}
