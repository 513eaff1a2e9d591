//! # Arbor Host — control core for activity-tree workflow instances
//!
//! `arbor-host` is the host-facing side of a long-running workflow
//! engine: given an activity-tree interpreter (the
//! [`ActivityEngine`](engine::ActivityEngine) collaborator), it drives
//! execution and exposes mutually-exclusive control operations to
//! arbitrary concurrent callers:
//!
//! - **Admission**: every host call — run, cancel, terminate, persist,
//!   unload, bookmark resumption, load, abort — is serialized onto a
//!   single logical *turn* per instance, parked callers waking in
//!   admission order.
//! - **Turn scheduling**: after every engine suspension the core decides
//!   whether to dispatch pending work, re-invoke the engine, raise idle,
//!   raise completion, or go dormant.
//! - **Durable checkpointing**: persistence is sequenced collect → map →
//!   save → unlock/delete across an optional
//!   [`PersistencePipeline`](pipeline::PersistencePipeline) and optional
//!   [`InstanceStore`](store::InstanceStore), so a crash at any point
//!   leaves the store consistent.
//! - **Bookmark resumption**: a retry protocol that defers resumptions
//!   the engine refuses until the instance demonstrably made progress.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use arbor_host::{InstanceController, InstanceOptions};
//!
//! # async fn demo(engine: Box<dyn arbor_host::engine::ActivityEngine>) {
//! let controller = InstanceController::new(engine, InstanceOptions::default());
//! controller.run(Duration::from_secs(5)).await.unwrap();
//! let result = controller
//!     .resume_bookmark("await-approval", serde_json::json!(true), Duration::from_secs(5))
//!     .await
//!     .unwrap();
//! println!("{:?}", result);
//! # }
//! ```

pub mod core;
pub mod engine;
pub mod error;
pub mod pipeline;
pub mod snapshot;
pub mod store;

pub use crate::core::{
    HostConfig, IdleInfo, InstanceController, InstanceEvent, InstanceHandler, InstanceLifecycle,
    InstanceOptions, NoopHandler, PersistKind, PersistPause, PersistableIdleAction,
    UnhandledExceptionAction,
};
pub use error::{ControlError, ControlResult, PipelineError, StoreError};
pub use snapshot::{FaultInfo, InstanceSnapshot, InstanceStatus};
