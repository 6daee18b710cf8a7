//! Command execution on worker threads: backend handlers plus the node-level commands that
//! need no backend.
//!
//! Storage backends are opaque to the I/O core: they implement [`BackendHandler`] and produce
//! replies through a [`Replier`]. The [`CommandProcessor`] is the bridge installed into every
//! worker pool; it gates unauthenticated peers, routes to handlers, and emits the terminal
//! acknowledgement frame.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, RwLock};

use eddy_common::config::NodeConfig;
use eddy_common::error::{libc_consts, EddyError, EddyResult};
use eddy_common::ids::BackendId;
use eddy_net::pool::{IoReq, RequestProcessor};
use eddy_net::state::{JoinState, OutgoingFrame, PeerState};
use eddy_proto::frame::{flags, FrameHeader};
use eddy_proto::CommandKind;
use hashbrown::HashMap;
use tracing::{debug, error, warn};

/// Protocol version advertised in `REVERSE_LOOKUP` replies.
pub const NODE_VERSION: [i32; 4] = [1, 0, 0, 0];

/// Reply channel handed to backend handlers; frames inherit the request's identity.
pub struct Replier<'a> {
    peer: &'a Arc<PeerState>,
    request: &'a FrameHeader,
}

impl Replier<'_> {
    /// Queues one reply frame. `more` marks the reply as non-terminal so the requester keeps
    /// its transaction open for the frames that follow.
    ///
    /// # Errors
    ///
    /// Returns `EddyError::ConnectionReset` when the requester's link is already gone.
    pub fn send_reply(&self, payload: Vec<u8>, more: bool, status: i32) -> EddyResult<()> {
        let mut reply_flags = flags::REPLY;
        if more {
            reply_flags |= flags::MORE;
        }
        let header = FrameHeader {
            id: self.request.id,
            command: self.request.command,
            flags: reply_flags,
            trans: self.request.trans,
            trace_id: self.request.trace_id,
            backend_id: self.request.backend_id,
            size: payload.len() as u64,
            status,
        };
        self.peer
            .queue_frame(OutgoingFrame::with_body(header, payload), None)
    }
}

/// One storage backend as seen by the I/O core.
pub trait BackendHandler: Send + Sync {
    /// Handles one decoded request, producing any number of replies.
    ///
    /// # Errors
    ///
    /// The returned error's errno is stamped into the terminal acknowledgement.
    fn handle(
        &self,
        header: &FrameHeader,
        payload: &[u8],
        replier: &Replier<'_>,
    ) -> EddyResult<()>;
}

/// Worker-side command processor: auth gate, builtin node commands, backend routing, and the
/// terminal acknowledgement.
pub struct CommandProcessor {
    config: NodeConfig,
    local_addr: RwLock<String>,
    backends: RwLock<HashMap<BackendId, Arc<dyn BackendHandler>>>,
    require_auth: bool,
    node_status: AtomicI32,
    backpressure: Arc<eddy_net::backpressure::Backpressure>,
}

impl CommandProcessor {
    #[must_use]
    pub fn new(config: NodeConfig, backpressure: Arc<eddy_net::backpressure::Backpressure>) -> Self {
        let require_auth = config.auth_cookie.iter().any(|byte| *byte != 0);
        Self {
            config,
            local_addr: RwLock::new(String::new()),
            backends: RwLock::new(HashMap::new()),
            require_auth,
            node_status: AtomicI32::new(0),
            backpressure,
        }
    }

    /// Records the bound listen address once the acceptor is up; `REVERSE_LOOKUP` replies
    /// carry it.
    pub fn set_local_addr(&self, addr: String) {
        *self.local_addr.write().expect("local addr lock poisoned") = addr;
    }

    pub fn register_backend(&self, backend_id: BackendId, handler: Arc<dyn BackendHandler>) {
        let mut backends = self.backends.write().expect("backend table lock poisoned");
        let _ = backends.insert(backend_id, handler);
    }

    pub fn unregister_backend(&self, backend_id: BackendId) {
        let mut backends = self.backends.write().expect("backend table lock poisoned");
        let _ = backends.remove(&backend_id);
    }

    #[must_use]
    pub fn backend_ids(&self) -> Vec<BackendId> {
        let backends = self.backends.read().expect("backend table lock poisoned");
        let mut ids = backends.keys().copied().collect::<Vec<_>>();
        ids.sort_unstable();
        ids
    }

    /// Auth gate for accepted peers: before anything else they must present the cookie.
    /// Returns false when the request must not be executed.
    fn check_auth(&self, req: &IoReq) -> bool {
        if !self.require_auth
            || req.peer.join_state() != JoinState::Accepted
            || req.peer.is_authenticated()
        {
            return true;
        }
        if req.header.command == CommandKind::Auth {
            if self.config.auth_cookie_matches(&req.payload) {
                req.peer.mark_authenticated();
                return true;
            }
            warn!(peer = %req.peer.addr(), "auth cookie mismatch, resetting peer");
        } else {
            warn!(
                peer = %req.peer.addr(),
                cmd = req.header.command.name(),
                "command before auth, resetting peer"
            );
        }
        req.peer.reset(-libc_consts::EPERM);
        false
    }

    fn execute(&self, req: &IoReq) -> EddyResult<()> {
        let replier = Replier {
            peer: &req.peer,
            request: &req.header,
        };
        match req.header.command {
            CommandKind::Auth => Ok(()),
            CommandKind::Status => {
                // A 4-byte payload updates the advertised node status before reporting it.
                if req.payload.len() == 4 {
                    let requested =
                        i32::from_le_bytes(req.payload[..4].try_into().expect("length checked"));
                    self.node_status.store(requested, Ordering::Release);
                }
                let status = self.node_status.load(Ordering::Acquire);
                let body = format!(
                    "status: {status}\nflags: {:#x}\nbackends: {}\n",
                    self.config.flags.0,
                    self.backend_ids().len()
                );
                replier.send_reply(body.into_bytes(), false, 0)
            }
            CommandKind::ReverseLookup => {
                // The request payload may carry the peer's protocol version (4 x i32 LE);
                // remember it on the connection before answering with ours.
                if req.payload.len() >= 16 {
                    let mut version = [0_i32; 4];
                    for (slot, chunk) in version.iter_mut().zip(req.payload.chunks_exact(4)) {
                        *slot = i32::from_le_bytes(chunk.try_into().expect("chunk width is fixed"));
                    }
                    req.peer.set_version(version);
                }
                let addr = self
                    .local_addr
                    .read()
                    .expect("local addr lock poisoned")
                    .clone();
                let [major, minor, patch, tweak] = NODE_VERSION;
                let body = format!("addr: {addr}\nversion: {major}.{minor}.{patch}.{tweak}\n");
                replier.send_reply(body.into_bytes(), false, 0)
            }
            CommandKind::Join => {
                req.peer.set_join_state(JoinState::Joined);
                debug!(peer = %req.peer.addr(), "peer joined the network");
                Ok(())
            }
            CommandKind::RouteList => {
                if self
                    .config
                    .flags
                    .contains(eddy_common::config::NodeFlags::NO_ROUTE_LIST)
                {
                    return Err(EddyError::InvalidState("route list exchange is disabled"));
                }
                replier.send_reply(Vec::new(), false, 0)
            }
            CommandKind::MonitorStat => {
                let mut body = String::new();
                for (slot, (count, errors)) in req.peer.stats().snapshot().iter().enumerate() {
                    if *count == 0 {
                        continue;
                    }
                    let name = CommandKind::from_code(slot as u32).name();
                    body.push_str(&format!("{name} count: {count} errors: {errors}\n"));
                }
                body.push_str(&format!(
                    "io.blocked: {}\nio.queued: {}\nsend_queue: {}\n",
                    i32::from(self.backpressure.is_blocked()),
                    self.backpressure.queued(),
                    req.peer.send_queue_len()
                ));
                replier.send_reply(body.into_bytes(), false, 0)
            }
            CommandKind::BackendStatus => {
                let ids = self.backend_ids();
                let body = ids
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(",");
                replier.send_reply(body.into_bytes(), false, 0)
            }
            CommandKind::BackendControl
            | CommandKind::BulkReadNew
            | CommandKind::BulkRemoveNew => Err(EddyError::InvalidState("command is not served by this node")),
            _ => self.execute_backend(req, &replier),
        }
    }

    fn execute_backend(&self, req: &IoReq, replier: &Replier<'_>) -> EddyResult<()> {
        let handler = {
            let backends = self.backends.read().expect("backend table lock poisoned");
            backends.get(&req.header.backend_id).map(Arc::clone)
        };
        let Some(handler) = handler else {
            debug!(
                peer = %req.peer.addr(),
                backend = req.header.backend_id,
                cmd = req.header.command.name(),
                "no backend for command"
            );
            return Err(EddyError::InvalidState("no backend serves this command"));
        };
        handler.handle(&req.header, &req.payload, replier)
    }
}

impl RequestProcessor for CommandProcessor {
    fn process(&self, req: IoReq) {
        if !self.check_auth(&req) {
            req.release();
            return;
        }

        // Handler panics must not take the worker thread down; they surface to the requester
        // as an EINVAL acknowledgement.
        let outcome = catch_unwind(AssertUnwindSafe(|| self.execute(&req)));
        let status = match outcome {
            Ok(Ok(())) => 0,
            Ok(Err(error)) => {
                debug!(
                    peer = %req.peer.addr(),
                    cmd = req.header.command.name(),
                    %error,
                    "command failed"
                );
                error.errno()
            }
            Err(_panic) => {
                error!(
                    peer = %req.peer.addr(),
                    cmd = req.header.command.name(),
                    "command handler panicked"
                );
                -libc_consts::EINVAL
            }
        };

        if req.header.has_flag(flags::NEED_ACK) {
            let mut ack = FrameHeader::destroy_sentinel(req.header.trans, status);
            ack.id = req.header.id;
            ack.command = req.header.command;
            ack.backend_id = req.header.backend_id;
            if let Err(error) = req
                .peer
                .queue_frame(OutgoingFrame::header_only(ack), None)
            {
                debug!(peer = %req.peer.addr(), %error, "failed to queue acknowledgement");
            }
        }
        req.release();
    }
}
