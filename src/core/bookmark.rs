//! The bookmark-resumption retry protocol: a wait/grant loop atop the
//! admission queue that re-enqueues a deferred variant whenever the
//! engine refuses a resumption it looked ready for.

use std::time::Duration;

use serde_json::Value;

use super::controller::ControllerInner;
use super::lifecycle::InstanceLifecycle;
use super::operation::{Operation, OperationKind};
use crate::engine::{BookmarkResumption, EngineState, TrackingRecord};
use crate::error::{ControlError, ControlResult};

fn remaining(deadline: tokio::time::Instant) -> ControlResult<Duration> {
    let now = tokio::time::Instant::now();
    if now >= deadline {
        Err(ControlError::Timeout)
    } else {
        Ok(deadline - now)
    }
}

impl ControllerInner {
    pub(crate) async fn resume_bookmark(
        &self,
        name: &str,
        value: Value,
        timeout: Duration,
    ) -> ControlResult<BookmarkResumption> {
        let deadline = tokio::time::Instant::now() + timeout;

        // Opportunistic auto-run so a resumption can be the first host
        // call an instance ever sees. Best-effort: the operation below
        // observes whatever state results.
        let needs_run = {
            let state = self.queue.lock();
            !state.has_started && !state.lifecycle.is_terminal()
        };
        if needs_run {
            if let Err(e) = self.run_operation(remaining(deadline)?).await {
                tracing::debug!("opportunistic run before bookmark resumption: {}", e);
            }
        }

        let mut op = Operation::new(OperationKind::RequiresIdle, false, true);
        self.queue.begin_enqueue();
        self.queue.enqueue(&op, false, &self.pause);
        self.queue.end_enqueue();

        loop {
            let left = match remaining(deadline) {
                Ok(left) => left,
                Err(e) => {
                    if self.queue.remove(&op) {
                        return Err(e);
                    }
                    // A grant won the race; take the turn so it can be
                    // released, then report the expiry.
                    op.acquired().await;
                    self.run_turn_loop().await;
                    return Err(e);
                }
            };
            self.queue.wait(&op, left).await?;

            // The turn is held from here until run_turn_loop releases it.
            let short_circuit = {
                let state = self.queue.lock();
                if state.lifecycle.is_terminal() {
                    Some(BookmarkResumption::NotReady)
                } else if state.completion_raised || state.engine_state == EngineState::Complete {
                    Some(BookmarkResumption::NotFound)
                } else {
                    None
                }
            };
            if let Some(result) = short_circuit {
                self.run_turn_loop().await;
                return Ok(result);
            }

            let resumption = {
                let mut engine = self.engine.lock().await;
                let result = engine.schedule_bookmark_resumption(name, value.clone());
                self.refresh_mirror(&**engine);
                result
            };
            match resumption {
                BookmarkResumption::Success => {
                    {
                        let mut state = self.queue.lock();
                        state.lifecycle = InstanceLifecycle::Runnable;
                        state.has_started = true;
                    }
                    if let Err(e) = self.flush_tracking(TrackingRecord::new("resumed")).await {
                        tracing::warn!("tracking flush after bookmark resumption failed: {}", e);
                    }
                    self.run_turn_loop().await;
                    return Ok(BookmarkResumption::Success);
                }
                BookmarkResumption::NotFound => {
                    self.run_turn_loop().await;
                    return Ok(BookmarkResumption::NotFound);
                }
                BookmarkResumption::NotReady => {
                    // The queue thought the engine was idle but the engine
                    // refused. Park a deferred retry, admissible only once
                    // the admission counter proves something happened,
                    // and let the instance make progress.
                    op = Operation::new(OperationKind::DeferredRequiresIdle, false, true);
                    self.queue.begin_enqueue();
                    self.queue.enqueue(&op, false, &self.pause);
                    self.queue.end_enqueue();
                    self.run_turn_loop().await;
                }
            }
        }
    }
}
