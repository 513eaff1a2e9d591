//! The persistence pipeline seam.
//!
//! A pipeline lets host extensions contribute values to a persistence
//! episode: local values are collected, mapped into durable form, handed
//! to the store alongside the engine snapshot, and finally published to
//! extension-owned side storage. The core sequences the stages; what each
//! stage does is the extension's business.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::PipelineError;

/// Extension-provided stages of a persistence episode.
///
/// Stages are only driven by the turn holder, one episode at a time, but
/// `abort` may arrive from a foreign task while a stage is in flight, so
/// the whole trait works through shared references and implementations
/// keep their stage state behind interior mutability.
#[async_trait]
pub trait PersistencePipeline: Send + Sync {
    /// Hand loaded mapped values back to the extensions after a load.
    fn set_loaded_values(&self, values: HashMap<String, Value>);

    /// Gather local values from the extensions.
    async fn collect(&self) -> Result<(), PipelineError>;

    /// Map collected values into their durable form.
    async fn map(&self) -> Result<(), PipelineError>;

    /// The mapped values to record with the snapshot.
    fn values(&self) -> HashMap<String, Value>;

    /// Pipeline-owned save IO, after the store write succeeded.
    async fn save(&self, timeout: Duration) -> Result<(), PipelineError>;

    /// Pipeline-owned load IO, before loaded values are handed out.
    async fn load(&self, timeout: Duration) -> Result<(), PipelineError>;

    /// Publish the completed save to extension-owned side storage.
    async fn publish(&self) -> Result<(), PipelineError>;

    /// Best-effort cancellation of whatever stage is in flight.
    fn abort(&self);
}
