//! Error types for the instance control core.
//!
//! - [`ControlError`] — Top-level errors for host-facing control operations.
//! - [`StoreError`] — Errors raised by a durable instance store.
//! - [`PipelineError`] — Errors raised by a persistence pipeline.

pub mod control_error;
pub mod pipeline_error;
pub mod store_error;

pub use control_error::ControlError;
pub use pipeline_error::PipelineError;
pub use store_error::StoreError;

/// Convenience alias for control-operation results.
pub type ControlResult<T> = Result<T, ControlError>;
