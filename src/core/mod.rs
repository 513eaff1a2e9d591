//! The concurrency/sequencing core: admission, turn scheduling,
//! persistence sequencing, and the bookmark retry protocol.

pub(crate) mod admission;
mod bookmark;
pub mod controller;
pub mod events;
pub mod lifecycle;
pub(crate) mod operation;
pub mod pause;
pub mod persistence;

pub use controller::{HostConfig, InstanceController, InstanceOptions};
pub use events::{
    EventEmitter, IdleInfo, InstanceEvent, InstanceHandler, NoopHandler, PersistableIdleAction,
    UnhandledExceptionAction,
};
pub use lifecycle::InstanceLifecycle;
pub use pause::PersistPause;
pub use persistence::PersistKind;
