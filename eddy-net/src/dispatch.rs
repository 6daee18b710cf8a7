//! Backend selection and request routing into the worker pools.
//!
//! For every decoded request the dispatcher computes a backend id, stamps it into the
//! in-flight header, and pushes the work item to the blocking or non-blocking pool of the
//! backend's place. Overload from a bounded queue is answered to the sender as a failed
//! acknowledgement, never as a connection reset.

use std::sync::Arc;

use eddy_common::error::{libc_consts, EddyError, EddyResult};
use eddy_common::ids::{BackendId, ObjectId, SYSTEM_BACKEND_ID};
use eddy_proto::frame::{flags, FrameHeader};
use tracing::{debug, warn};

use crate::pool::{IngressSink, IoReq, PoolManager, PushOutcome};
use crate::state::OutgoingFrame;

/// Read-balancing knobs forwarded to the route lookup. Both are independent; when both are
/// set, weight mixing applies before randomization.
#[derive(Debug, Clone, Copy, Default)]
pub struct RouteOpts {
    pub mix_states: bool,
    pub randomize_states: bool,
}

/// Lookup hook into the route table: which backend owns a key. The table itself lives
/// outside the I/O core.
pub trait RouteTable: Send + Sync {
    fn backend_for_key(&self, key: &ObjectId, opts: RouteOpts) -> Option<BackendId>;
}

/// A route table for nodes that own no backends; everything lands on the system place.
pub struct EmptyRouteTable;

impl RouteTable for EmptyRouteTable {
    fn backend_for_key(&self, _key: &ObjectId, _opts: RouteOpts) -> Option<BackendId> {
        None
    }
}

/// Routes decoded requests to worker pools.
pub struct Dispatcher {
    pools: Arc<PoolManager>,
    route: Arc<dyn RouteTable>,
    route_opts: RouteOpts,
}

impl Dispatcher {
    #[must_use]
    pub fn new(pools: Arc<PoolManager>, route: Arc<dyn RouteTable>, route_opts: RouteOpts) -> Self {
        Self {
            pools,
            route,
            route_opts,
        }
    }

    #[must_use]
    pub fn pools(&self) -> &Arc<PoolManager> {
        &self.pools
    }

    /// Computes the backend id for one request header.
    ///
    /// `DIRECT_BACKEND` frames carry the id verbatim; backend-less command kinds use the
    /// system id; everything else asks the route table, falling back to the system id when no
    /// backend owns the key.
    #[must_use]
    pub fn resolve_backend(&self, header: &FrameHeader) -> BackendId {
        if header.has_flag(flags::DIRECT_BACKEND) {
            return header.backend_id;
        }
        if !header.command.needs_backend() {
            return SYSTEM_BACKEND_ID;
        }
        self.route
            .backend_for_key(&header.id, self.route_opts)
            .unwrap_or(SYSTEM_BACKEND_ID)
    }
}

impl IngressSink for Dispatcher {
    /// Routes one decoded request: resolve the backend, stamp it into the header, pick the
    /// pool by the `NOLOCK` flag, push.
    ///
    /// # Errors
    ///
    /// Propagates pool errors other than `Overload`; overload is answered to the sender here
    /// with an `EBUSY` acknowledgement and reported as success to the poller.
    fn ingest(&self, mut req: IoReq) -> EddyResult<()> {
        let backend_id = self.resolve_backend(&req.header);
        req.header.backend_id = backend_id;

        let nonblocking = req.header.has_flag(flags::NOLOCK);
        let place = self.pools.place_for(backend_id);
        let pool = place.select(nonblocking);

        debug!(
            peer = %req.peer.addr(),
            cmd = req.header.command.name(),
            backend = backend_id,
            nonblocking,
            "scheduling request"
        );

        match pool.push(req) {
            PushOutcome::Queued => Ok(()),
            PushOutcome::PoolFull(req) => {
                Self::reject_overloaded(&req);
                req.release();
                Ok(())
            }
            PushOutcome::ShuttingDown(req) => {
                req.release();
                Err(EddyError::InvalidState("worker pool is shutting down"))
            }
        }
    }
}

impl Dispatcher {
    /// Builds and queues the failure acknowledgement for an overloaded request.
    fn reject_overloaded(req: &IoReq) {
        warn!(
            peer = %req.peer.addr(),
            cmd = req.header.command.name(),
            trans = req.header.trans,
            "worker pool is full, rejecting request"
        );
        if req.header.has_flag(flags::NEED_ACK) {
            let ack = FrameHeader::destroy_sentinel(req.header.trans, -libc_consts::EBUSY);
            let _ = req.peer.queue_frame(OutgoingFrame::header_only(ack), None);
        }
    }
}
