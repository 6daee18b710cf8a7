//! Reconnection bookkeeping for reset peers.
//!
//! Reset locally initiated links land here with their join state. A periodic pass takes the
//! entries whose backoff deadline passed, in bounded batches, and tries to re-establish them.
//! Failures double the backoff up to a cap; a successful attach removes the entry.

use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use tracing::{debug, info};

use crate::state::JoinState;

/// First retry delay after a reset.
pub const BACKOFF_BASE: Duration = Duration::from_secs(1);
/// Retry delay ceiling.
pub const BACKOFF_CAP: Duration = Duration::from_secs(64);

#[derive(Debug, Clone, Copy)]
struct ReconnectEntry {
    join_state: JoinState,
    backoff: Duration,
    next_attempt: Instant,
    attempts: u32,
}

/// A reconnect attempt handed to the caller; report the outcome back with
/// [`ReconnectRegistry::note_success`] / [`ReconnectRegistry::note_failure`].
#[derive(Debug, Clone, Copy)]
pub struct ReconnectTarget {
    pub addr: SocketAddr,
    pub join_state: JoinState,
    pub attempts: u32,
}

/// Addresses awaiting reconnection, keyed by canonical peer address.
#[derive(Default)]
pub struct ReconnectRegistry {
    inner: Mutex<HashMap<SocketAddr, ReconnectEntry>>,
}

impl ReconnectRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a reset peer for reconnection. Re-registering an address keeps its grown
    /// backoff so a flapping peer cannot reset the schedule.
    pub fn register(&self, addr: SocketAddr, join_state: JoinState) {
        let mut inner = self.inner.lock().expect("reconnect registry lock poisoned");
        let entry = inner.entry(addr).or_insert(ReconnectEntry {
            join_state,
            backoff: BACKOFF_BASE,
            next_attempt: Instant::now() + BACKOFF_BASE,
            attempts: 0,
        });
        entry.join_state = join_state;
        debug!(peer = %addr, backoff_secs = entry.backoff.as_secs(), "scheduled reconnect");
    }

    /// Takes up to `batch_size` due entries. Taken entries stay registered with their backoff
    /// already advanced, so a crashed attempt self-heals into a later retry.
    #[must_use]
    pub fn due_batch(&self, now: Instant, batch_size: usize) -> Vec<ReconnectTarget> {
        let mut inner = self.inner.lock().expect("reconnect registry lock poisoned");
        let mut batch = Vec::new();
        for (addr, entry) in inner.iter_mut() {
            if batch.len() >= batch_size {
                break;
            }
            if entry.next_attempt > now {
                continue;
            }
            batch.push(ReconnectTarget {
                addr: *addr,
                join_state: entry.join_state,
                attempts: entry.attempts,
            });
            entry.attempts += 1;
            entry.backoff = (entry.backoff * 2).min(BACKOFF_CAP);
            entry.next_attempt = now + entry.backoff;
        }
        batch
    }

    /// The peer is back; forget it.
    pub fn note_success(&self, addr: SocketAddr) {
        let mut inner = self.inner.lock().expect("reconnect registry lock poisoned");
        if inner.remove(&addr).is_some() {
            info!(peer = %addr, "peer reconnected");
        }
    }

    /// The attempt failed; the backoff advanced when the entry was taken, nothing to do but
    /// log.
    pub fn note_failure(&self, addr: SocketAddr) {
        let inner = self.inner.lock().expect("reconnect registry lock poisoned");
        if let Some(entry) = inner.get(&addr) {
            debug!(
                peer = %addr,
                attempts = entry.attempts,
                backoff_secs = entry.backoff.as_secs(),
                "reconnect attempt failed"
            );
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("reconnect registry lock poisoned")
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::{ReconnectRegistry, BACKOFF_BASE, BACKOFF_CAP};
    use crate::state::JoinState;
    use googletest::prelude::*;
    use rstest::rstest;
    use std::net::SocketAddr;
    use std::time::{Duration, Instant};

    fn addr() -> SocketAddr {
        "10.0.0.1:1025".parse().expect("literal address must parse")
    }

    #[rstest]
    fn entry_becomes_due_after_base_backoff() {
        let registry = ReconnectRegistry::new();
        registry.register(addr(), JoinState::Joined);

        let now = Instant::now();
        assert_that!(registry.due_batch(now, 10).len(), eq(0));
        let later = now + BACKOFF_BASE + Duration::from_millis(10);
        let batch = registry.due_batch(later, 10);
        assert_that!(batch.len(), eq(1));
        assert_that!(batch[0].addr, eq(addr()));
        assert_that!(batch[0].join_state, eq(JoinState::Joined));
    }

    #[rstest]
    fn backoff_doubles_up_to_the_cap() {
        let registry = ReconnectRegistry::new();
        registry.register(addr(), JoinState::Connected);

        let mut now = Instant::now() + BACKOFF_BASE + Duration::from_millis(10);
        let mut expected = BACKOFF_BASE;
        for _ in 0..10 {
            let batch = registry.due_batch(now, 10);
            assert_that!(batch.len(), eq(1));
            expected = (expected * 2).min(BACKOFF_CAP);
            // Just before the advanced deadline nothing is due.
            let early = now + expected - Duration::from_millis(10);
            assert_that!(registry.due_batch(early, 10).len(), eq(0));
            now += expected + Duration::from_millis(10);
        }
    }

    #[rstest]
    fn success_removes_the_entry() {
        let registry = ReconnectRegistry::new();
        registry.register(addr(), JoinState::Joined);
        registry.note_success(addr());
        assert_that!(registry.is_empty(), eq(true));
    }

    #[rstest]
    fn batch_size_bounds_one_pass() {
        let registry = ReconnectRegistry::new();
        for index in 0..10_u8 {
            let peer: SocketAddr = format!("10.0.0.{index}:1025")
                .parse()
                .expect("literal address must parse");
            registry.register(peer, JoinState::Connected);
        }
        let later = Instant::now() + BACKOFF_BASE + Duration::from_millis(10);
        assert_that!(registry.due_batch(later, 3).len(), eq(3));
    }
}
