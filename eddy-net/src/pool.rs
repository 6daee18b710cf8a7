//! Worker pools and the per-backend pool pairs.
//!
//! A pool is a set of native threads sharing one queue under a mutex/condvar pair. Three
//! disciplines exist: `Blocking` (FIFO), `NonBlocking` (FIFO, reserved for `NOLOCK` commands
//! that must not wait on backend mutexes), and `Lifo` (stack order for bursty short commands).
//! Pools grow at runtime by spawning additional workers and shrink only through shutdown.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use eddy_common::error::{EddyError, EddyResult};
use eddy_proto::FrameHeader;
use hashbrown::HashMap;
use tracing::{debug, info};

use crate::backpressure::Backpressure;
use crate::state::PeerState;
use crate::sys;

/// How long an idle worker sleeps on the queue condvar before re-checking `need_exit`.
const WORKER_IDLE_SLICE: Duration = Duration::from_secs(1);

/// Queue discipline of one worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolDiscipline {
    Blocking,
    NonBlocking,
    Lifo,
}

impl PoolDiscipline {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            PoolDiscipline::Blocking => "blocking",
            PoolDiscipline::NonBlocking => "nonblocking",
            PoolDiscipline::Lifo => "lifo",
        }
    }
}

/// Post-processing hooks applied after a work item is fully handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PostFlags(pub u32);

impl PostFlags {
    /// Close the attached descriptor when the item is released.
    pub const CLOSE_FD: u32 = 1 << 0;
    /// Tell the page cache the attached file's pages will not be reused.
    pub const UNCACHE: u32 = 1 << 1;

    #[must_use]
    pub fn contains(self, bit: u32) -> bool {
        (self.0 & bit) != 0
    }
}

/// A decoded inbound frame queued for a worker.
///
/// The item owns everything the handler needs and keeps its connection alive through the
/// `peer` reference until released.
pub struct IoReq {
    pub header: FrameHeader,
    pub payload: Vec<u8>,
    pub peer: Arc<PeerState>,
    pub enqueued_at: Instant,
    /// Wall time the receive state machine spent assembling this frame, microseconds.
    pub recv_time_usecs: u64,
    /// Name of the pool this item was queued to; stamped at push time.
    pub pool_id: String,
    pub post: PostFlags,
    pub file: Option<std::fs::File>,
}

impl IoReq {
    #[must_use]
    pub fn new(header: FrameHeader, payload: Vec<u8>, peer: Arc<PeerState>, recv_time_usecs: u64) -> Self {
        Self {
            header,
            payload,
            peer,
            enqueued_at: Instant::now(),
            recv_time_usecs,
            pool_id: String::new(),
            post: PostFlags::default(),
            file: None,
        }
    }

    /// Applies post-processing hooks; dropping the file closes its descriptor.
    pub fn release(mut self) {
        if let Some(file) = self.file.take() {
            if self.post.contains(PostFlags::UNCACHE) {
                sys::drop_page_cache(&file);
            }
            if self.post.contains(PostFlags::CLOSE_FD) {
                drop(file);
            }
        }
    }
}

/// Sink for decoded inbound requests; the poller feeds it from the receive state machine.
pub trait IngressSink: Send + Sync {
    /// Routes one decoded request to a pool.
    ///
    /// # Errors
    ///
    /// Returns `EddyError::Overload` when the selected pool queue is bounded and full; the
    /// caller surfaces that to the sender as a failure reply.
    fn ingest(&self, req: IoReq) -> EddyResult<()>;
}

/// Handler side of a pool: invoked on worker threads for every dequeued item.
pub trait RequestProcessor: Send + Sync {
    fn process(&self, req: IoReq);
}

/// Result of [`WorkPool::push`]. Rejections hand the item back so the caller can answer the
/// sender.
pub enum PushOutcome {
    Queued,
    /// Bounded queue is at `queue_limit`.
    PoolFull(IoReq),
    /// The pool is draining for shutdown.
    ShuttingDown(IoReq),
}

struct PoolShared {
    discipline: PoolDiscipline,
    pool_id: String,
    queue: Mutex<VecDeque<IoReq>>,
    available: Condvar,
    /// 0 disables the bound; otherwise push fails with `Overload` at this depth.
    queue_limit: usize,
    need_exit: AtomicBool,
    depth: AtomicUsize,
    active: AtomicUsize,
    backpressure: Arc<Backpressure>,
    processor: Arc<dyn RequestProcessor>,
    ionice: Option<(i32, i32)>,
}

/// One worker pool: a discipline, a bounded queue, and a growable set of threads.
pub struct WorkPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkPool {
    #[must_use]
    pub fn new(
        discipline: PoolDiscipline,
        pool_id: String,
        queue_limit: usize,
        backpressure: Arc<Backpressure>,
        processor: Arc<dyn RequestProcessor>,
        ionice: Option<(i32, i32)>,
    ) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                discipline,
                pool_id,
                queue: Mutex::new(VecDeque::new()),
                available: Condvar::new(),
                queue_limit,
                need_exit: AtomicBool::new(false),
                depth: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                backpressure,
                processor,
                ionice,
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Grows the pool by `count` worker threads.
    ///
    /// # Errors
    ///
    /// Returns `EddyError::Io` when thread spawning fails; already spawned workers keep
    /// running.
    pub fn grow(&self, count: usize) -> EddyResult<()> {
        let mut workers = self.workers.lock().expect("worker list lock poisoned");
        let before = workers.len();
        for index in before..before + count {
            let shared = Arc::clone(&self.shared);
            let join = thread::Builder::new()
                .name(format!("eddy-{}-{}-{index}", shared.pool_id, shared.discipline.name()))
                .spawn(move || worker_thread_main(&shared))
                .map_err(|error| {
                    EddyError::Io(format!(
                        "spawn worker {index} of pool {} failed: {error}",
                        self.shared.pool_id
                    ))
                })?;
            workers.push(join);
            self.shared.backpressure.add_workers(1);
        }
        info!(
            pool = %self.shared.pool_id,
            mode = self.shared.discipline.name(),
            from = before,
            to = workers.len(),
            "grew worker pool"
        );
        Ok(())
    }

    /// Enqueues one work item under the pool discipline.
    ///
    /// A bounded queue at capacity rejects the item instead of blocking; the caller owns the
    /// returned item and surfaces the overload to the sender.
    pub fn push(&self, mut req: IoReq) -> PushOutcome {
        if self.shared.need_exit.load(Ordering::Acquire) {
            return PushOutcome::ShuttingDown(req);
        }
        req.pool_id = self.shared.pool_id.clone();
        {
            let mut queue = self.shared.queue.lock().expect("pool queue lock poisoned");
            if self.shared.queue_limit != 0 && queue.len() >= self.shared.queue_limit {
                return PushOutcome::PoolFull(req);
            }
            queue.push_back(req);
        }
        let _ = self.shared.depth.fetch_add(1, Ordering::AcqRel);
        self.shared.backpressure.on_enqueued();
        self.shared.available.notify_one();
        PushOutcome::Queued
    }

    #[must_use]
    pub fn queue_depth(&self) -> usize {
        self.shared.depth.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn active_workers(&self) -> usize {
        self.shared.active.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.lock().expect("worker list lock poisoned").len()
    }

    /// Stops every worker and joins them. Queued items are released unprocessed.
    pub fn shutdown(&self) {
        self.shared.need_exit.store(true, Ordering::Release);
        self.shared.available.notify_all();
        let mut workers = self.workers.lock().expect("worker list lock poisoned");
        let count = workers.len();
        for join in workers.drain(..) {
            let _ = join.join();
        }
        self.shared.backpressure.remove_workers(count as u64);

        let drained = {
            let mut queue = self.shared.queue.lock().expect("pool queue lock poisoned");
            queue.drain(..).collect::<Vec<_>>()
        };
        for req in drained {
            let _ = self.shared.depth.fetch_sub(1, Ordering::AcqRel);
            self.shared.backpressure.on_dequeued();
            req.release();
        }
    }
}

fn worker_thread_main(shared: &Arc<PoolShared>) {
    if let Some((class, prio)) = shared.ionice {
        sys::set_io_priority(class, prio);
    }
    debug!(
        pool = %shared.pool_id,
        mode = shared.discipline.name(),
        "started io worker"
    );

    while !shared.need_exit.load(Ordering::Acquire) {
        let req = {
            let mut queue = shared.queue.lock().expect("pool queue lock poisoned");
            loop {
                if shared.need_exit.load(Ordering::Acquire) {
                    return;
                }
                let popped = match shared.discipline {
                    PoolDiscipline::Blocking | PoolDiscipline::NonBlocking => queue.pop_front(),
                    PoolDiscipline::Lifo => queue.pop_back(),
                };
                if let Some(req) = popped {
                    break req;
                }
                let (next, _timeout) = shared
                    .available
                    .wait_timeout(queue, WORKER_IDLE_SLICE)
                    .expect("pool queue lock poisoned");
                queue = next;
            }
        };

        let _ = shared.depth.fetch_sub(1, Ordering::AcqRel);
        shared.backpressure.on_dequeued();
        let _ = shared.active.fetch_add(1, Ordering::AcqRel);

        let queue_time = req.enqueued_at.elapsed();
        debug!(
            pool = %req.pool_id,
            cmd = req.header.command.name(),
            trans = req.header.trans,
            queue_usecs = queue_time.as_micros() as u64,
            recv_usecs = req.recv_time_usecs,
            "processing io event"
        );
        shared.processor.process(req);

        let _ = shared.active.fetch_sub(1, Ordering::AcqRel);
    }

    debug!(
        pool = %shared.pool_id,
        mode = shared.discipline.name(),
        "finished io worker"
    );
}

/// The per-backend pair of pools: blocking plus non-blocking.
pub struct PoolPlace {
    pub blocking: WorkPool,
    pub nonblocking: WorkPool,
}

impl PoolPlace {
    /// Selects the pool for a frame by its `NOLOCK` flag.
    #[must_use]
    pub fn select(&self, nonblocking: bool) -> &WorkPool {
        if nonblocking {
            &self.nonblocking
        } else {
            &self.blocking
        }
    }

    pub fn shutdown(&self) {
        self.nonblocking.shutdown();
        self.blocking.shutdown();
    }

    #[must_use]
    pub fn queue_depth(&self) -> usize {
        self.blocking.queue_depth() + self.nonblocking.queue_depth()
    }
}

/// Routes a backend id to its pool place; backend id -1 is the backend-less system place.
pub struct PoolManager {
    system: Arc<PoolPlace>,
    backends: std::sync::RwLock<HashMap<i32, Arc<PoolPlace>>>,
}

impl PoolManager {
    #[must_use]
    pub fn new(system: Arc<PoolPlace>) -> Self {
        Self {
            system,
            backends: std::sync::RwLock::new(HashMap::new()),
        }
    }

    /// Resolves the place for a backend id, falling back to the system place for ids no
    /// backend claims.
    #[must_use]
    pub fn place_for(&self, backend_id: i32) -> Arc<PoolPlace> {
        if backend_id >= 0 {
            let backends = self.backends.read().expect("backend map lock poisoned");
            if let Some(place) = backends.get(&backend_id) {
                return Arc::clone(place);
            }
        }
        Arc::clone(&self.system)
    }

    pub fn attach_backend(&self, backend_id: i32, place: Arc<PoolPlace>) {
        let mut backends = self.backends.write().expect("backend map lock poisoned");
        let _ = backends.insert(backend_id, place);
    }

    pub fn detach_backend(&self, backend_id: i32) -> Option<Arc<PoolPlace>> {
        let mut backends = self.backends.write().expect("backend map lock poisoned");
        backends.remove(&backend_id)
    }

    #[must_use]
    pub fn system_place(&self) -> Arc<PoolPlace> {
        Arc::clone(&self.system)
    }

    /// Total queued work across every place, for stat snapshots.
    #[must_use]
    pub fn total_queue_depth(&self) -> usize {
        let backends = self.backends.read().expect("backend map lock poisoned");
        let mut depth = self.system.queue_depth();
        for place in backends.values() {
            depth += place.queue_depth();
        }
        depth
    }

    pub fn shutdown(&self) {
        let places = {
            let backends = self.backends.read().expect("backend map lock poisoned");
            backends.values().cloned().collect::<Vec<_>>()
        };
        for place in places {
            place.shutdown();
        }
        self.system.shutdown();
    }
}
