use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// Re-armable request for the engine to pause at its next persistable point.
///
/// The control core arms this when a persistence-admitting operation is
/// parked behind a running engine; engine implementations watch it and
/// yield the turn once they reach a safe checkpoint region.
#[derive(Clone, Default)]
pub struct PersistPause {
    inner: Arc<PauseInner>,
}

#[derive(Default)]
struct PauseInner {
    requested: AtomicBool,
    notify: Notify,
}

impl PersistPause {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.inner.requested.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    pub fn is_requested(&self) -> bool {
        self.inner.requested.load(Ordering::Acquire)
    }

    pub fn clear(&self) {
        self.inner.requested.store(false, Ordering::Release);
    }

    /// Wait until a pause has been requested.
    pub async fn requested(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_requested() {
                return;
            }
            notified.await;
        }
    }
}
