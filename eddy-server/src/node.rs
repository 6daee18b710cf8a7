//! Node lifecycle: owns the pollers, the pools, the backpressure gate, and the maintenance
//! threads, and enforces init/teardown order.
//!
//! Bring-up order is pools before pollers before acceptor before maintenance threads, so that
//! by the time a byte can arrive every downstream consumer exists. Teardown reverses it:
//! the exit flag stops intake, pollers drain and join, pools stop, and every surviving
//! connection is reset so outstanding callbacks fire their destroy frames.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use eddy_common::addr::format_addr;
use eddy_common::config::{NodeConfig, NodeFlags};
use eddy_common::error::{libc_consts, EddyError, EddyResult};
use eddy_common::ids::{BackendId, SYSTEM_BACKEND_ID};
use eddy_net::backpressure::Backpressure;
use eddy_net::dispatch::{Dispatcher, EmptyRouteTable, RouteOpts, RouteTable};
use eddy_net::poller::{AcceptHandler, Acceptor, NetPoller, PollerHandle};
use eddy_net::pool::{PoolDiscipline, PoolManager, PoolPlace, WorkPool};
use eddy_net::reconnect::ReconnectRegistry;
use eddy_net::state::{JoinState, PeerOptions, PeerState};
use eddy_net::sys;
use mio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::backend::{BackendHandler, CommandProcessor};

/// How finely the maintenance threads slice their sleeps so exit stays responsive.
const MAINTENANCE_SLICE: Duration = Duration::from_millis(250);

/// Reset code for connections torn down by node shutdown rather than a peer failure.
const SHUTDOWN_RESET_CODE: i32 = -libc_consts::ENXIO;

/// Everything the accept path and maintenance threads share with the node.
pub struct NodeShared {
    config: NodeConfig,
    backpressure: Arc<Backpressure>,
    pools: Arc<PoolManager>,
    processor: Arc<CommandProcessor>,
    reconnects: Arc<ReconnectRegistry>,
    need_exit: Arc<AtomicI32>,
    states: Mutex<Vec<Weak<PeerState>>>,
    poller_handles: Mutex<Vec<PollerHandle>>,
    attach_rr: AtomicUsize,
}

impl NodeShared {
    fn peer_options(&self) -> PeerOptions {
        PeerOptions {
            backpressure: Arc::clone(&self.backpressure),
            reconnects: Some(Arc::clone(&self.reconnects)),
            send_limit: self.config.send_limit,
            wait_timeout: self.config.wait_timeout,
        }
    }

    /// Round-robin poller assignment, then track the state for sweeps and teardown.
    fn adopt(&self, peer: Arc<PeerState>) -> EddyResult<()> {
        {
            let mut states = self.states.lock().expect("state list lock poisoned");
            states.retain(|state| state.upgrade().is_some());
            states.push(Arc::downgrade(&peer));
        }
        let handles = self.poller_handles.lock().expect("poller list lock poisoned");
        if handles.is_empty() {
            return Err(EddyError::InvalidState("node has no pollers"));
        }
        let index = self.attach_rr.fetch_add(1, Ordering::AcqRel) % handles.len();
        handles[index].attach(peer)
    }

    #[must_use]
    fn live_states(&self) -> Vec<Arc<PeerState>> {
        let states = self.states.lock().expect("state list lock poisoned");
        states.iter().filter_map(Weak::upgrade).collect()
    }
}

impl AcceptHandler for NodeShared {
    fn handle_accepted(&self, stream: TcpStream, peer_addr: SocketAddr) {
        let peer = PeerState::new(stream, peer_addr, 0, JoinState::Accepted, self.peer_options());
        if let Err(error) = self.adopt(Arc::clone(&peer)) {
            warn!(peer = %peer_addr, %error, "failed to adopt accepted connection");
            peer.reset(-libc_consts::EBADF);
        }
    }
}

/// One `eddy` node process: client, server, and router at once.
pub struct Node {
    shared: Arc<NodeShared>,
    pollers: Vec<NetPoller>,
    acceptor: Option<Acceptor>,
    sweeper: Option<JoinHandle<()>>,
    reconnector: Option<JoinHandle<()>>,
}

impl Node {
    /// Builds a client-only node: pollers and pools but no listener.
    ///
    /// # Errors
    ///
    /// Returns the first bring-up failure; everything already started is torn down by drop.
    pub fn new_client(config: NodeConfig) -> EddyResult<Self> {
        Self::build(config, None, Arc::new(EmptyRouteTable))
    }

    /// Builds a server node listening on `listen_addr`.
    ///
    /// # Errors
    ///
    /// Returns the first bring-up failure; everything already started is torn down by drop.
    pub fn new_server(
        config: NodeConfig,
        listen_addr: SocketAddr,
        route: Arc<dyn RouteTable>,
    ) -> EddyResult<Self> {
        Self::build(config, Some(listen_addr), route)
    }

    fn build(
        config: NodeConfig,
        listen_addr: Option<SocketAddr>,
        route: Arc<dyn RouteTable>,
    ) -> EddyResult<Self> {
        let config = config.normalized();
        let backpressure = Arc::new(Backpressure::new());
        let need_exit = Arc::new(AtomicI32::new(0));
        let reconnects = Arc::new(ReconnectRegistry::new());
        let processor = Arc::new(CommandProcessor::new(
            config.clone(),
            Arc::clone(&backpressure),
        ));

        let ionice = Some((config.bg_ionice_class, config.bg_ionice_prio));
        let system_place = Arc::new(PoolPlace {
            blocking: WorkPool::new(
                PoolDiscipline::Blocking,
                "sys".to_string(),
                0,
                Arc::clone(&backpressure),
                Arc::clone(&processor) as Arc<dyn eddy_net::pool::RequestProcessor>,
                ionice,
            ),
            nonblocking: WorkPool::new(
                PoolDiscipline::NonBlocking,
                "sys".to_string(),
                0,
                Arc::clone(&backpressure),
                Arc::clone(&processor) as Arc<dyn eddy_net::pool::RequestProcessor>,
                ionice,
            ),
        });
        system_place.blocking.grow(config.io_thread_num)?;
        system_place
            .nonblocking
            .grow(config.nonblocking_io_thread_num)?;
        let pools = Arc::new(PoolManager::new(system_place));

        let route_opts = RouteOpts {
            mix_states: config.flags.contains(NodeFlags::MIX_STATES),
            randomize_states: config.flags.contains(NodeFlags::RANDOMIZE_STATES),
        };
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&pools), route, route_opts));

        let shared = Arc::new(NodeShared {
            config: config.clone(),
            backpressure: Arc::clone(&backpressure),
            pools,
            processor: Arc::clone(&processor),
            reconnects: Arc::clone(&reconnects),
            need_exit: Arc::clone(&need_exit),
            states: Mutex::new(Vec::new()),
            poller_handles: Mutex::new(Vec::new()),
            attach_rr: AtomicUsize::new(0),
        });

        let mut pollers = Vec::with_capacity(config.net_thread_num);
        for index in 0..config.net_thread_num {
            let poller = NetPoller::spawn(
                format!("eddy-net-{index}"),
                Arc::clone(&dispatcher),
                Arc::clone(&backpressure),
                Arc::clone(&need_exit),
            )?;
            shared
                .poller_handles
                .lock()
                .expect("poller list lock poisoned")
                .push(poller.handle());
            pollers.push(poller);
        }

        let acceptor = match listen_addr {
            Some(listen_addr) => {
                let acceptor = Acceptor::spawn(
                    listen_addr,
                    config.server_prio,
                    Arc::clone(&shared) as Arc<dyn AcceptHandler>,
                    Arc::clone(&backpressure),
                    Arc::clone(&need_exit),
                )?;
                processor.set_local_addr(format_addr(&acceptor.local_addr()));
                info!(addr = %acceptor.local_addr(), "node is listening");
                Some(acceptor)
            }
            None => None,
        };

        let sweeper = Some(spawn_stall_sweeper(Arc::clone(&shared))?);
        let reconnector = Some(spawn_reconnector(Arc::clone(&shared))?);

        Ok(Self {
            shared,
            pollers,
            acceptor,
            sweeper,
            reconnector,
        })
    }

    #[must_use]
    pub fn shared(&self) -> &Arc<NodeShared> {
        &self.shared
    }

    #[must_use]
    pub fn processor(&self) -> &Arc<CommandProcessor> {
        &self.shared.processor
    }

    #[must_use]
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.acceptor.as_ref().map(Acceptor::local_addr)
    }

    #[must_use]
    pub fn need_exit(&self) -> i32 {
        self.shared.need_exit.load(Ordering::Acquire)
    }

    /// Registers a storage backend: its handler plus a dedicated pool place.
    ///
    /// # Errors
    ///
    /// Returns pool spawn failures.
    pub fn register_backend(
        &self,
        backend_id: BackendId,
        handler: Arc<dyn BackendHandler>,
        io_threads: usize,
        nonblocking_io_threads: usize,
        queue_limit: usize,
    ) -> EddyResult<()> {
        if backend_id == SYSTEM_BACKEND_ID {
            return Err(EddyError::InvalidConfig(
                "backend id -1 is reserved for the system place",
            ));
        }
        let ionice = Some((
            self.shared.config.bg_ionice_class,
            self.shared.config.bg_ionice_prio,
        ));
        let place = Arc::new(PoolPlace {
            blocking: WorkPool::new(
                PoolDiscipline::Blocking,
                format!("backend-{backend_id}"),
                queue_limit,
                Arc::clone(&self.shared.backpressure),
                Arc::clone(&self.shared.processor) as Arc<dyn eddy_net::pool::RequestProcessor>,
                ionice,
            ),
            nonblocking: WorkPool::new(
                PoolDiscipline::NonBlocking,
                format!("backend-{backend_id}"),
                queue_limit,
                Arc::clone(&self.shared.backpressure),
                Arc::clone(&self.shared.processor) as Arc<dyn eddy_net::pool::RequestProcessor>,
                ionice,
            ),
        });
        place.blocking.grow(io_threads.max(1))?;
        place.nonblocking.grow(nonblocking_io_threads.max(1))?;

        self.shared.processor.register_backend(backend_id, handler);
        self.shared.pools.attach_backend(backend_id, place);
        info!(backend = backend_id, "registered backend");
        Ok(())
    }

    /// Connects to a remote peer and attaches the new state to a poller.
    ///
    /// # Errors
    ///
    /// Returns `EddyError::Io` when the TCP connect fails.
    pub fn connect(&self, addr: SocketAddr, join_state: JoinState) -> EddyResult<Arc<PeerState>> {
        connect_peer(&self.shared, addr, join_state)
    }

    /// Flags the node for exit and wakes everything that may be parked.
    pub fn request_exit(&self, code: i32) {
        let code = if code == 0 { 1 } else { code };
        let _ = self
            .shared
            .need_exit
            .compare_exchange(0, code, Ordering::AcqRel, Ordering::Acquire);
        self.shared.backpressure.request_exit();
    }

    /// Blocks until something sets the exit flag.
    pub fn wait(&self) {
        while self.need_exit() == 0 {
            thread::sleep(MAINTENANCE_SLICE);
        }
    }

    /// Orderly teardown; also run by drop.
    pub fn shutdown(&mut self) {
        self.request_exit(1);

        if let Some(mut acceptor) = self.acceptor.take() {
            acceptor.join();
        }
        for poller in &mut self.pollers {
            poller.shutdown();
        }
        if let Some(sweeper) = self.sweeper.take() {
            let _ = sweeper.join();
        }
        if let Some(reconnector) = self.reconnector.take() {
            let _ = reconnector.join();
        }

        // Reset surviving connections so every outstanding callback observes its destroy
        // frame before the pools disappear under the work items.
        for peer in self.shared.live_states() {
            peer.reset(SHUTDOWN_RESET_CODE);
        }
        self.shared.pools.shutdown();
        info!("node stopped");
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn connect_peer(
    shared: &Arc<NodeShared>,
    addr: SocketAddr,
    join_state: JoinState,
) -> EddyResult<Arc<PeerState>> {
    let std_stream = std::net::TcpStream::connect_timeout(&addr, shared.config.wait_timeout)
        .map_err(|error| EddyError::Io(format!("connect to {addr} failed: {error}")))?;
    std_stream
        .set_nonblocking(true)
        .map_err(|error| EddyError::Io(format!("set nonblocking on {addr} failed: {error}")))?;
    let stream = TcpStream::from_std(std_stream);
    let _ = stream.set_nodelay(true);
    sys::set_socket_priority(&stream, shared.config.client_prio);

    let peer = PeerState::new(stream, addr, 0, join_state, shared.peer_options());
    if let Err(error) = shared.adopt(Arc::clone(&peer)) {
        peer.reset(-libc_consts::EBADF);
        return Err(error);
    }
    debug!(peer = %addr, "connected to peer");
    Ok(peer)
}

/// Walks every live connection's timer index on the configured interval; connections whose
/// accumulated stall count crosses the limit are reset with a timeout code.
fn spawn_stall_sweeper(shared: Arc<NodeShared>) -> EddyResult<JoinHandle<()>> {
    thread::Builder::new()
        .name("eddy-stall-sweep".to_string())
        .spawn(move || {
            let check_timeout = shared.config.check_timeout;
            let stall_limit = shared.config.stall_count;
            let mut next_sweep = Instant::now() + check_timeout;
            while shared.need_exit.load(Ordering::Acquire) == 0 {
                thread::sleep(MAINTENANCE_SLICE.min(check_timeout));
                if Instant::now() < next_sweep {
                    continue;
                }
                next_sweep = Instant::now() + check_timeout;

                let now = Instant::now();
                for peer in shared.live_states() {
                    if peer.need_exit() != 0 {
                        continue;
                    }
                    let stalled = peer.transactions().stalled_count(now, check_timeout);
                    if stalled == 0 {
                        continue;
                    }
                    let total = peer.note_stalled(stalled as u32);
                    debug!(
                        peer = %peer.addr(),
                        stalled,
                        total,
                        "stall sweep found idle transactions"
                    );
                    if total >= stall_limit {
                        warn!(peer = %peer.addr(), total, "stall limit reached, resetting peer");
                        peer.reset(-libc_consts::ETIMEDOUT);
                    }
                }
            }
        })
        .map_err(|error| EddyError::Io(format!("spawn stall sweeper failed: {error}")))
}

/// Revives reset outbound links in bounded batches with the registry's backoff schedule.
fn spawn_reconnector(shared: Arc<NodeShared>) -> EddyResult<JoinHandle<()>> {
    thread::Builder::new()
        .name("eddy-reconnect".to_string())
        .spawn(move || {
            while shared.need_exit.load(Ordering::Acquire) == 0 {
                thread::sleep(MAINTENANCE_SLICE);
                let batch = shared
                    .reconnects
                    .due_batch(Instant::now(), shared.config.reconnect_batch_size);
                for target in batch {
                    if shared.need_exit.load(Ordering::Acquire) != 0 {
                        break;
                    }
                    match connect_peer(&shared, target.addr, target.join_state) {
                        Ok(_peer) => shared.reconnects.note_success(target.addr),
                        Err(error) => {
                            debug!(peer = %target.addr, %error, "reconnect attempt failed");
                            shared.reconnects.note_failure(target.addr);
                        }
                    }
                }
            }
        })
        .map_err(|error| EddyError::Io(format!("spawn reconnector failed: {error}")))
}
