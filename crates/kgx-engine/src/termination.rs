//! Shared termination signal
//!
//! Termination is the only cancellation primitive: cooperative, sticky,
//! and observed between loop iterations. In-flight work is never
//! interrupted; the next iteration simply does not start.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// A cloneable, sticky termination flag.
///
/// Once requested it stays set; every waiter wakes, including those that
/// start waiting after the request.
#[derive(Debug, Clone, Default)]
pub struct Termination {
    inner: Arc<TerminationInner>,
}

#[derive(Debug, Default)]
struct TerminationInner {
    requested: AtomicBool,
    notify: Notify,
}

impl Termination {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request termination and wake all waiters
    pub fn request(&self) {
        self.inner.requested.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Whether termination has been requested
    pub fn is_requested(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    /// Wait until termination is requested.
    ///
    /// Returns immediately if it already was.
    pub async fn wait(&self) {
        let mut notified = std::pin::pin!(self.inner.notify.notified());
        loop {
            if self.is_requested() {
                return;
            }
            // Register before the final check so a request landing in
            // between still wakes this waiter
            notified.as_mut().enable();
            if self.is_requested() {
                return;
            }
            notified.as_mut().await;
            notified.set(self.inner.notify.notified());
        }
    }
}
