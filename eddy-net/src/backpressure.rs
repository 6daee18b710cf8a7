//! Global gate coupling network ingress to worker queue depth.
//!
//! Pollers stop servicing readable events while the total queued work exceeds
//! `QUEUE_RATIO_PER_WORKER x total worker threads` across all pools. Writable events keep
//! flowing so reply traffic drains first and the node cannot deadlock on its own output.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Queued requests tolerated per worker thread before ingress is suspended.
pub const QUEUE_RATIO_PER_WORKER: u64 = 1000;

#[derive(Debug, Default)]
struct Gate {
    blocked: bool,
}

/// Shared backpressure controller. One per node, handed to every pool and poller.
#[derive(Debug, Default)]
pub struct Backpressure {
    queued: AtomicU64,
    workers: AtomicU64,
    need_exit: AtomicBool,
    gate: Mutex<Gate>,
    ready: Condvar,
}

impl Backpressure {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Accounts worker threads joining a pool; the limit scales with this count.
    pub fn add_workers(&self, count: u64) {
        let _ = self.workers.fetch_add(count, Ordering::AcqRel);
        self.ready.notify_all();
    }

    pub fn remove_workers(&self, count: u64) {
        let _ = self.workers.fetch_sub(count, Ordering::AcqRel);
    }

    pub fn on_enqueued(&self) {
        let _ = self.queued.fetch_add(1, Ordering::AcqRel);
    }

    pub fn on_dequeued(&self) {
        let before = self.queued.fetch_sub(1, Ordering::AcqRel);
        // Crossing back under the limit must wake suspended pollers promptly.
        if before.saturating_sub(1) <= self.limit() {
            self.ready.notify_all();
        }
    }

    fn limit(&self) -> u64 {
        self.workers
            .load(Ordering::Acquire)
            .saturating_mul(QUEUE_RATIO_PER_WORKER)
    }

    /// True while pollers may keep feeding inbound frames to the pools.
    #[must_use]
    pub fn below_limit(&self) -> bool {
        self.queued.load(Ordering::Acquire) <= self.limit()
    }

    #[must_use]
    pub fn queued(&self) -> u64 {
        self.queued.load(Ordering::Acquire)
    }

    /// Whether some poller is currently parked on the gate (`io.blocked` in stat snapshots).
    #[must_use]
    pub fn is_blocked(&self) -> bool {
        self.gate.lock().expect("backpressure gate poisoned").blocked
    }

    /// Wakes parked pollers; called when a socket gains writable work or queues drain.
    pub fn notify_writable(&self) {
        self.ready.notify_all();
    }

    /// Marks the node as exiting and releases every parked poller immediately.
    pub fn request_exit(&self) {
        self.need_exit.store(true, Ordering::Release);
        self.ready.notify_all();
    }

    #[must_use]
    pub fn exit_requested(&self) -> bool {
        self.need_exit.load(Ordering::Acquire)
    }

    /// Parks the calling poller until the queues drain, a socket becomes writable, or the node
    /// exits. Each wait leg is bounded so a missed wakeup costs at most `slice`.
    pub fn wait_until_ready(&self, slice: Duration) {
        let mut gate = self.gate.lock().expect("backpressure gate poisoned");
        gate.blocked = true;
        while !self.exit_requested() && !self.below_limit() {
            let (next, timeout) = self
                .ready
                .wait_timeout(gate, slice)
                .expect("backpressure gate poisoned");
            gate = next;
            if timeout.timed_out() {
                break;
            }
        }
        gate.blocked = false;
    }
}
