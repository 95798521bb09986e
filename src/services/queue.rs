//! Downstream queue with high/low water marks.
//!
//! # Responsibilities
//! - Count requests handed to the downstream layer and not yet answered
//! - Pause new dispatches once the high-water mark is reached
//! - Resume dispatching when the queue drains to the low-water mark
//!
//! # Design Decisions
//! - Dispatch awaits instead of failing; an HTTP/1.1 connection whose dispatch
//!   is parked stops reading the socket, which is the backpressure signal
//! - The slot is released on drop, so cancelled requests free capacity too

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

#[derive(Debug)]
pub struct DownstreamQueue {
    queued: AtomicUsize,
    paused: AtomicBool,
    high: usize,
    low: usize,
    resumed: Notify,
}

impl DownstreamQueue {
    pub fn new(high: usize, low: usize) -> Self {
        Self {
            queued: AtomicUsize::new(0),
            paused: AtomicBool::new(false),
            high: high.max(1),
            low: low.min(high.saturating_sub(1)),
            resumed: Notify::new(),
        }
    }

    /// Wait until dispatching is allowed, then occupy one slot.
    pub async fn enter(self: &Arc<Self>) -> QueueSlot {
        loop {
            let notified = self.resumed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.paused.load(Ordering::Acquire) {
                break;
            }
            tracing::trace!(queued = self.len(), "Downstream queue paused, waiting");
            notified.await;
        }

        let queued = self.queued.fetch_add(1, Ordering::AcqRel) + 1;
        if queued >= self.high && !self.paused.swap(true, Ordering::AcqRel) {
            tracing::debug!(queued, high = self.high, "Downstream queue above high-water mark");
        }

        QueueSlot { queue: Arc::clone(self) }
    }

    /// Requests currently held by the downstream layer.
    pub fn len(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    fn leave(&self) {
        let queued = self.queued.fetch_sub(1, Ordering::AcqRel) - 1;
        if queued <= self.low && self.paused.swap(false, Ordering::AcqRel) {
            tracing::debug!(queued, low = self.low, "Downstream queue resumed");
            self.resumed.notify_waiters();
        }
    }
}

/// One occupied queue position. Released on drop.
#[derive(Debug)]
pub struct QueueSlot {
    queue: Arc<DownstreamQueue>,
}

impl Drop for QueueSlot {
    fn drop(&mut self) {
        self.queue.leave();
    }
}
