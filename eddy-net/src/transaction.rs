//! Per-connection transaction registry.
//!
//! Every locally originated request becomes a [`Transaction`] held in two indexes: the primary
//! tree ordered by transaction id and a timer index ordered by last activity (insertion order
//! breaks ties). Reply demux removes the entry from the timer index before any callback runs,
//! so the stall sweep can never fire a callback concurrently with reply delivery.
//!
//! User callbacks are never invoked under the table lock: demux only unlinks entries and
//! records the delivery in a [`CallbackOutbox`] which the caller flushes after releasing it.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use eddy_common::clock::is_stalled;
use eddy_common::error::{EddyError, EddyResult};
use eddy_common::ids::ObjectId;
use eddy_proto::frame::{flags, FrameHeader};
use eddy_proto::CommandKind;
use tracing::error;

/// Completion callback invoked once per reply frame plus exactly once with the terminal
/// destroy frame (`DESTROY` flag set, status carrying the final code).
pub type CompletionCallback = Box<dyn FnMut(&FrameHeader, &[u8]) + Send>;

/// One outstanding request awaiting reply frames.
pub struct Transaction {
    id: u64,
    key: ObjectId,
    command: CommandKind,
    created: Instant,
    inner: Mutex<TransactionInner>,
}

struct TransactionInner {
    callback: Option<CompletionCallback>,
    /// Peer signalled that additional reply frames follow.
    more_expected: bool,
}

impl Transaction {
    fn new(id: u64, key: ObjectId, command: CommandKind, callback: CompletionCallback) -> Self {
        Self {
            id,
            key,
            command,
            created: Instant::now(),
            inner: Mutex::new(TransactionInner {
                callback: Some(callback),
                more_expected: false,
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn key(&self) -> ObjectId {
        self.key
    }

    #[must_use]
    pub fn command(&self) -> CommandKind {
        self.command
    }

    #[must_use]
    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    /// Delivers one reply frame. A terminal delivery consumes the callback; later calls become
    /// no-ops, which keeps the destroy contract at exactly once even when reset races demux.
    fn complete(&self, header: &FrameHeader, payload: &[u8], terminal: bool) {
        let mut inner = self.inner.lock().expect("transaction callback lock poisoned");
        inner.more_expected = header.has_flag(flags::MORE);
        if terminal {
            let Some(mut callback) = inner.callback.take() else {
                return;
            };
            drop(inner);
            Self::invoke(&mut callback, header, payload, self.id);
        } else if let Some(callback) = inner.callback.as_mut() {
            Self::invoke(callback, header, payload, self.id);
        }
    }

    /// Invokes the terminal callback with a synthesized destroy frame carrying `status`.
    pub fn destroy(&self, status: i32) {
        let sentinel = FrameHeader::destroy_sentinel(self.id, status);
        self.complete(&sentinel, &[], true);
    }

    fn invoke(callback: &mut CompletionCallback, header: &FrameHeader, payload: &[u8], id: u64) {
        // A panicking completion must not unwind into the poller; the transaction is already
        // unlinked at this point, so swallowing the panic leaks nothing.
        let result = catch_unwind(AssertUnwindSafe(|| callback(header, payload)));
        if result.is_err() {
            error!(trans = id, "completion callback panicked");
        }
    }
}

/// Key of the timer index: last activity first, insertion sequence as the FIFO tie-break.
type TimerKey = (Instant, u64);

struct TableEntry {
    trans: Arc<Transaction>,
    timer_key: Option<TimerKey>,
}

struct TableInner {
    next_id: u64,
    next_seq: u64,
    by_id: BTreeMap<u64, TableEntry>,
    timer: BTreeMap<TimerKey, u64>,
}

/// Both transaction indexes of one connection behind a single lock.
pub struct TransactionTable {
    inner: Mutex<TableInner>,
}

impl Default for TransactionTable {
    fn default() -> Self {
        Self::new()
    }
}

/// What reply demux decided under the lock; callbacks run later via the outbox.
pub enum ReplyDisposition {
    /// No transaction with this id; the frame is logged and dropped.
    Unknown,
    /// Frame matched; `terminal` is set when no more replies are expected.
    Matched { terminal: bool },
}

impl TransactionTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TableInner {
                next_id: 1,
                next_seq: 0,
                by_id: BTreeMap::new(),
                timer: BTreeMap::new(),
            }),
        }
    }

    /// Registers a fresh transaction and returns its id.
    ///
    /// # Errors
    ///
    /// Returns `EddyError::ConnectionReset` with `reset_code` when the owning connection is
    /// already going away; the callback is destroyed through the outbox in that case.
    pub fn register(
        &self,
        key: ObjectId,
        command: CommandKind,
        callback: CompletionCallback,
        reset_code: i32,
        outbox: &mut CallbackOutbox,
    ) -> EddyResult<u64> {
        let trans = {
            let mut inner = self.inner.lock().expect("transaction table lock poisoned");
            if reset_code != 0 {
                drop(inner);
                let doomed = Arc::new(Transaction::new(0, key, command, callback));
                outbox.push_destroy(doomed, reset_code);
                return Err(EddyError::ConnectionReset(reset_code));
            }
            let id = inner.next_id;
            inner.next_id += 1;
            let seq = inner.next_seq;
            inner.next_seq += 1;
            let timer_key = (Instant::now(), seq);
            let trans = Arc::new(Transaction::new(id, key, command, callback));
            let _ = inner.timer.insert(timer_key, id);
            let _ = inner.by_id.insert(
                id,
                TableEntry {
                    trans: Arc::clone(&trans),
                    timer_key: Some(timer_key),
                },
            );
            trans
        };
        Ok(trans.id())
    }

    /// Demultiplexes one reply frame.
    ///
    /// Under the lock this only unlinks indexes and records the delivery in `outbox`; the
    /// caller invokes callbacks after releasing every connection lock. A terminal frame that
    /// itself carries `DESTROY` is the destroy delivery; otherwise a destroy sentinel is
    /// synthesized right after the reply.
    pub fn match_reply(
        &self,
        header: &FrameHeader,
        payload: &[u8],
        outbox: &mut CallbackOutbox,
    ) -> ReplyDisposition {
        let mut inner = self.inner.lock().expect("transaction table lock poisoned");
        let (timer_key, trans) = {
            let Some(entry) = inner.by_id.get_mut(&header.trans) else {
                return ReplyDisposition::Unknown;
            };
            (entry.timer_key.take(), Arc::clone(&entry.trans))
        };

        // Always unlink from the timer index first so the stall sweep cannot walk into a
        // transaction whose callback is about to run.
        if let Some(key) = timer_key {
            let _ = inner.timer.remove(&key);
        }

        let terminal = !header.has_flag(flags::MORE);
        if terminal {
            let _ = inner.by_id.remove(&header.trans);
            drop(inner);
            if header.has_flag(flags::DESTROY) {
                outbox.push_terminal(trans, *header, payload.to_vec());
            } else {
                outbox.push_reply(Arc::clone(&trans), *header, payload.to_vec());
                outbox.push_destroy(trans, header.status);
            }
        } else {
            drop(inner);
            outbox.push_reply(trans, *header, payload.to_vec());
            outbox.rearm.push(header.trans);
        }
        ReplyDisposition::Matched { terminal }
    }

    /// Re-inserts a still-open transaction into the timer index with fresh activity.
    ///
    /// Called by the outbox after a `MORE` reply was delivered; a transaction reset in the
    /// meantime is simply gone and stays gone.
    pub fn rearm_timer(&self, trans_id: u64) {
        let mut inner = self.inner.lock().expect("transaction table lock poisoned");
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let timer_key = (Instant::now(), seq);
        let still_open = match inner.by_id.get_mut(&trans_id) {
            Some(entry) => {
                entry.timer_key = Some(timer_key);
                true
            }
            None => false,
        };
        if still_open {
            let _ = inner.timer.insert(timer_key, trans_id);
        }
    }

    /// Counts transactions idle longer than `timeout`, walking the timer index ascending.
    #[must_use]
    pub fn stalled_count(&self, now: Instant, timeout: Duration) -> usize {
        let inner = self.inner.lock().expect("transaction table lock poisoned");
        let mut stalled = 0;
        for (last_activity, _seq) in inner.timer.keys() {
            if is_stalled(now, *last_activity, timeout) {
                stalled += 1;
            } else {
                // The index is ordered by activity; everything after this entry is fresher.
                break;
            }
        }
        stalled
    }

    /// Unlinks one transaction by id, returning it for destroy delivery outside the lock.
    ///
    /// Used to undo a registration whose request frame never left the node.
    #[must_use]
    pub fn remove(&self, trans_id: u64) -> Option<Arc<Transaction>> {
        let mut inner = self.inner.lock().expect("transaction table lock poisoned");
        let entry = inner.by_id.remove(&trans_id)?;
        if let Some(key) = entry.timer_key {
            let _ = inner.timer.remove(&key);
        }
        Some(entry.trans)
    }

    /// Unlinks every transaction, returning them for destroy delivery outside the lock.
    #[must_use]
    pub fn drain(&self) -> Vec<Arc<Transaction>> {
        let mut inner = self.inner.lock().expect("transaction table lock poisoned");
        inner.timer.clear();
        let drained = std::mem::take(&mut inner.by_id);
        drained.into_values().map(|entry| entry.trans).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("transaction table lock poisoned")
            .by_id
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

enum OutboxItem {
    Reply {
        trans: Arc<Transaction>,
        header: FrameHeader,
        payload: Vec<u8>,
    },
    Terminal {
        trans: Arc<Transaction>,
        header: FrameHeader,
        payload: Vec<u8>,
    },
    Destroy {
        trans: Arc<Transaction>,
        status: i32,
    },
}

/// Deferred callback invocations accumulated while connection locks are held.
#[derive(Default)]
pub struct CallbackOutbox {
    items: Vec<OutboxItem>,
    rearm: Vec<u64>,
}

impl CallbackOutbox {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_reply(
        &mut self,
        trans: Arc<Transaction>,
        header: FrameHeader,
        payload: Vec<u8>,
    ) {
        self.items.push(OutboxItem::Reply {
            trans,
            header,
            payload,
        });
    }

    pub fn push_terminal(
        &mut self,
        trans: Arc<Transaction>,
        header: FrameHeader,
        payload: Vec<u8>,
    ) {
        self.items.push(OutboxItem::Terminal {
            trans,
            header,
            payload,
        });
    }

    pub fn push_destroy(&mut self, trans: Arc<Transaction>, status: i32) {
        self.items.push(OutboxItem::Destroy { trans, status });
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty() && self.rearm.is_empty()
    }

    /// Invokes every recorded callback in order and re-arms timers for `MORE` transactions.
    ///
    /// Must be called with no connection lock held.
    pub fn flush(&mut self, table: &TransactionTable) {
        for item in self.items.drain(..) {
            match item {
                OutboxItem::Reply {
                    trans,
                    header,
                    payload,
                } => trans.complete(&header, &payload, false),
                OutboxItem::Terminal {
                    trans,
                    header,
                    payload,
                } => trans.complete(&header, &payload, true),
                OutboxItem::Destroy { trans, status } => trans.destroy(status),
            }
        }
        for trans_id in self.rearm.drain(..) {
            table.rearm_timer(trans_id);
        }
    }
}
