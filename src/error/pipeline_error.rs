//! Persistence-pipeline errors.

use thiserror::Error;

/// Errors raised by a [`PersistencePipeline`](crate::pipeline::PersistencePipeline).
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Pipeline stage '{stage}' failed: {message}")]
    Stage { stage: String, message: String },
    #[error("Pipeline aborted")]
    Aborted,
    #[error("Pipeline timed out")]
    Timeout,
}

impl PipelineError {
    pub fn stage(stage: impl Into<String>, message: impl Into<String>) -> Self {
        PipelineError::Stage {
            stage: stage.into(),
            message: message.into(),
        }
    }
}
