//! Top-level control-operation errors.

use thiserror::Error;

use super::{PipelineError, StoreError};

/// Errors surfaced by host-facing control operations.
///
/// `Timeout` is recoverable and retry-safe. The state-conflict variants
/// (`Aborted`, `TerminatedOrCompleted`, `Unloaded`, `AlreadyHasIdentity`,
/// `NoStore`) each name the precondition that rejected the operation.
/// Store and pipeline failures propagate and fail the attempt that issued
/// them; best-effort cleanup failures are swallowed at the call site.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Operation timed out")]
    Timeout,
    #[error("Instance aborted: {0}")]
    Aborted(String),
    #[error("Instance has terminated or completed")]
    TerminatedOrCompleted,
    #[error("Instance unloaded")]
    Unloaded,
    #[error("Instance already has a durable identity")]
    AlreadyHasIdentity,
    #[error("No instance store configured")]
    NoStore,
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("Engine error: {0}")]
    Engine(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ControlError {
    /// Whether this error is an internal failure that converts the
    /// instance to Aborted, as opposed to a caller-facing rejection.
    pub(crate) fn aborts_instance(&self) -> bool {
        matches!(
            self,
            ControlError::Store(_)
                | ControlError::Pipeline(_)
                | ControlError::Engine(_)
                | ControlError::Internal(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_error_display() {
        assert_eq!(ControlError::Timeout.to_string(), "Operation timed out");
        assert_eq!(
            ControlError::Aborted("boom".into()).to_string(),
            "Instance aborted: boom"
        );
        assert_eq!(
            ControlError::TerminatedOrCompleted.to_string(),
            "Instance has terminated or completed"
        );
        assert_eq!(ControlError::Unloaded.to_string(), "Instance unloaded");
        assert_eq!(
            ControlError::NoStore.to_string(),
            "No instance store configured"
        );
    }

    #[test]
    fn test_abort_classification() {
        assert!(!ControlError::Timeout.aborts_instance());
        assert!(!ControlError::Unloaded.aborts_instance());
        assert!(ControlError::Internal("x".into()).aborts_instance());
        assert!(ControlError::Store(StoreError::Storage("io".into())).aborts_instance());
    }
}
