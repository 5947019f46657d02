//! Counting barrier for the load phase: every in-flight load increments the
//! counter, every completion decrements it, and waiters are released when it
//! returns to zero. This is what lets circular and diamond dependency graphs
//! load without modelling the graph shape.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

#[derive(Default)]
pub struct Deferred {
    count: AtomicUsize,
    notify: Notify,
}

impl Deferred {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// One more task in flight.
    pub fn begin(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    /// One task finished; releases waiters when the counter hits zero.
    pub fn end(&self) {
        let previous = self.count.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "Deferred::end without matching begin");
        if previous == 1 {
            self.notify.notify_waiters();
        }
    }

    pub fn pending(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Wait until all in-flight tasks have completed. Returns immediately if
    /// none are pending.
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}
