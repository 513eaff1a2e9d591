use serde::Serialize;

/// Coarse host-side lifecycle of an instance, independent of the engine's
/// finer Idle/Runnable/Complete state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceLifecycle {
    /// Loaded but not currently authorized to execute.
    Paused,
    /// Authorized to execute whenever the engine has work.
    Runnable,
    /// Persisted away; only cleanup admission succeeds from here.
    Unloaded,
    /// Torn down after a fault or an explicit abort.
    Aborted,
}

impl InstanceLifecycle {
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceLifecycle::Unloaded | InstanceLifecycle::Aborted)
    }
}
