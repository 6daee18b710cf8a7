//! Poller threads: the per-node network pollers and the dedicated acceptor.
//!
//! Each network poller owns one `mio::Poll` and services many connections. Ready events are
//! shuffled in place before processing: readiness arrives in FIFO order of the kernel queue,
//! and without the shuffle the same chatty peers would be serviced first every iteration,
//! starving quieter ones under load. Writable events are always serviced; readable events are
//! gated on the backpressure controller so reply traffic drains while ingress is suspended.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use eddy_common::addr::canonicalize;
use eddy_common::error::{libc_consts, EddyError, EddyResult};
use hashbrown::HashMap;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Registry, Token};
use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::backpressure::Backpressure;
use crate::dispatch::Dispatcher;
use crate::state::{PeerState, PollerBinding};
use crate::sys;

/// Poll timeout; also bounds how long attach commands can sit unserviced.
const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Initial readiness buffer size; doubles whenever a poll fills it.
const EVENT_BUFFER_START: usize = 100;

/// Token of the listening socket inside the acceptor poller.
const LISTENER_TOKEN: Token = Token(0);

/// Compact copy of one readiness event, safe to shuffle and hold across map lookups.
#[derive(Debug, Clone, Copy)]
pub(crate) struct EventSnapshot {
    pub(crate) token: Token,
    flags: u8,
}

const EVENT_FLAG_READABLE: u8 = 1 << 0;
const EVENT_FLAG_WRITABLE: u8 = 1 << 1;
const EVENT_FLAG_CLOSED: u8 = 1 << 2;
const EVENT_FLAG_ERROR: u8 = 1 << 3;

impl EventSnapshot {
    #[cfg(test)]
    pub(crate) fn for_token(token: Token) -> Self {
        Self { token, flags: 0 }
    }

    fn from_mio_event(event: &mio::event::Event) -> Self {
        let mut flags = 0_u8;
        if event.is_readable() {
            flags |= EVENT_FLAG_READABLE;
        }
        if event.is_writable() {
            flags |= EVENT_FLAG_WRITABLE;
        }
        if event.is_read_closed() || event.is_write_closed() {
            flags |= EVENT_FLAG_CLOSED;
        }
        if event.is_error() {
            flags |= EVENT_FLAG_ERROR;
        }
        Self {
            token: event.token(),
            flags,
        }
    }

    fn readable(self) -> bool {
        (self.flags & EVENT_FLAG_READABLE) != 0
    }

    fn writable(self) -> bool {
        (self.flags & EVENT_FLAG_WRITABLE) != 0
    }

    fn closed_or_error(self) -> bool {
        (self.flags & (EVENT_FLAG_CLOSED | EVENT_FLAG_ERROR)) != 0
    }
}

/// In-place Fisher-Yates permutation of the readiness batch.
pub(crate) fn shuffle_events(events: &mut [EventSnapshot]) {
    if events.len() < 2 {
        return;
    }
    let mut rng = rand::rng();
    for index in 0..events.len() - 1 {
        let swap_with = rng.random_range(index..events.len());
        events.swap(index, swap_with);
    }
}

enum PollerCommand {
    Register(Arc<PeerState>),
    Shutdown,
}

/// Cloneable attach endpoint of one poller; the acceptor and the node share these.
#[derive(Clone)]
pub struct PollerHandle {
    command_tx: Sender<PollerCommand>,
}

impl PollerHandle {
    /// Hands a connection to the poller thread.
    ///
    /// # Errors
    ///
    /// Returns `EddyError::InvalidState` when the poller is already gone.
    pub fn attach(&self, peer: Arc<PeerState>) -> EddyResult<()> {
        self.command_tx
            .send(PollerCommand::Register(peer))
            .map_err(|_| EddyError::InvalidState("net poller is not running"))
    }
}

/// Handle of one network poller thread.
pub struct NetPoller {
    name: String,
    command_tx: Sender<PollerCommand>,
    join: Option<JoinHandle<()>>,
}

impl NetPoller {
    /// Spawns a poller thread.
    ///
    /// # Errors
    ///
    /// Returns `EddyError::Io` when poll creation or thread spawn fails.
    pub fn spawn(
        name: String,
        dispatcher: Arc<Dispatcher>,
        backpressure: Arc<Backpressure>,
        node_exit: Arc<AtomicI32>,
    ) -> EddyResult<Self> {
        let poll =
            Poll::new().map_err(|error| EddyError::Io(format!("create poll failed: {error}")))?;
        let registry = Arc::new(
            poll.registry()
                .try_clone()
                .map_err(|error| EddyError::Io(format!("clone poll registry failed: {error}")))?,
        );
        let (command_tx, command_rx) = mpsc::channel::<PollerCommand>();
        let thread_name = name.clone();
        let join = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                net_poller_thread_main(
                    &thread_name,
                    poll,
                    &registry,
                    &command_rx,
                    &dispatcher,
                    &backpressure,
                    &node_exit,
                );
            })
            .map_err(|error| EddyError::Io(format!("spawn net poller failed: {error}")))?;
        Ok(Self {
            name,
            command_tx,
            join: Some(join),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cloneable attach endpoint for this poller.
    #[must_use]
    pub fn handle(&self) -> PollerHandle {
        PollerHandle {
            command_tx: self.command_tx.clone(),
        }
    }

    /// Hands a connection to this poller; registration happens on the poller thread before
    /// the next poll cycle.
    ///
    /// # Errors
    ///
    /// Returns `EddyError::InvalidState` when the poller is already gone.
    pub fn attach(&self, peer: Arc<PeerState>) -> EddyResult<()> {
        self.command_tx
            .send(PollerCommand::Register(peer))
            .map_err(|_| EddyError::InvalidState("net poller is not running"))
    }

    /// Asks the thread to finish and joins it.
    pub fn shutdown(&mut self) {
        let _ = self.command_tx.send(PollerCommand::Shutdown);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for NetPoller {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[allow(clippy::too_many_lines)]
fn net_poller_thread_main(
    name: &str,
    mut poll: Poll,
    registry: &Arc<Registry>,
    command_rx: &Receiver<PollerCommand>,
    dispatcher: &Arc<Dispatcher>,
    backpressure: &Arc<Backpressure>,
    node_exit: &Arc<AtomicI32>,
) {
    info!(poller = name, "started net poller");
    let mut events = Events::with_capacity(EVENT_BUFFER_START);
    let mut capacity = EVENT_BUFFER_START;
    let mut connections: HashMap<Token, Arc<PeerState>> = HashMap::new();
    let (retire_tx, retire_rx) = mpsc::channel::<Token>();
    let mut next_token = 1_usize;
    let mut last_suspend_log = Instant::now() - Duration::from_secs(2);
    // Readable events skipped while the pools were saturated. Readiness is edge-style, so the
    // skip must be replayed by hand once ingress resumes.
    let mut deferred_reads: Vec<Token> = Vec::new();

    while node_exit.load(Ordering::Acquire) == 0 {
        // Attach and retire between poll cycles; both channels are drained fully so a burst
        // of resets cannot pin stale references.
        loop {
            match command_rx.try_recv() {
                Ok(PollerCommand::Register(peer)) => {
                    let token = Token(next_token);
                    next_token = next_token.saturating_add(1);
                    let binding = PollerBinding {
                        registry: Arc::clone(registry),
                        token,
                        retire_tx: retire_tx.clone(),
                    };
                    match peer.bind_poller(binding) {
                        Ok(()) => {
                            debug!(poller = name, peer = %peer.addr(), "attached connection");
                            let _ = connections.insert(token, peer);
                        }
                        Err(bind_error) => {
                            error!(
                                poller = name,
                                peer = %peer.addr(),
                                error = %bind_error,
                                "failed to attach connection"
                            );
                            peer.reset(-libc_consts::EBADF);
                        }
                    }
                }
                Ok(PollerCommand::Shutdown) | Err(TryRecvError::Disconnected) => {
                    info!(poller = name, "finished net poller");
                    return;
                }
                Err(TryRecvError::Empty) => break,
            }
        }
        while let Ok(token) = retire_rx.try_recv() {
            let _ = connections.remove(&token);
        }

        // Replay reads deferred by backpressure before polling for new readiness.
        if !deferred_reads.is_empty() && backpressure.below_limit() {
            for token in std::mem::take(&mut deferred_reads) {
                let Some(peer) = connections.get(&token).map(Arc::clone) else {
                    continue;
                };
                if let Err(read_error) = peer.process_readable(dispatcher.as_ref()) {
                    peer.reset(read_error.errno());
                    let _ = connections.remove(&token);
                }
            }
        }

        // Grow the readiness buffer when the previous cycle filled it.
        if events.iter().count() >= capacity {
            capacity *= 2;
            events = Events::with_capacity(capacity);
        }

        if let Err(poll_error) = poll.poll(&mut events, Some(POLL_TIMEOUT)) {
            if poll_error.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            error!(poller = name, error = %poll_error, "failed to wait for io events");
            node_exit.store(
                -poll_error.raw_os_error().unwrap_or(libc_consts::EIO),
                Ordering::Release,
            );
            backpressure.request_exit();
            break;
        }

        let mut snapshots = events
            .iter()
            .map(EventSnapshot::from_mio_event)
            .collect::<Vec<_>>();
        shuffle_events(&mut snapshots);

        let mut processed = 0_usize;
        for snapshot in &snapshots {
            let Some(peer) = connections.get(&snapshot.token).map(Arc::clone) else {
                continue;
            };

            let mut failure: Option<i32> = None;
            if snapshot.writable() {
                processed += 1;
                if let Err(error) = peer.process_writable() {
                    failure = Some(error.errno());
                }
            }
            if failure.is_none() && snapshot.readable() {
                if backpressure.below_limit() {
                    processed += 1;
                    if let Err(error) = peer.process_readable(dispatcher.as_ref()) {
                        failure = Some(error.errno());
                    }
                } else {
                    deferred_reads.push(snapshot.token);
                }
            }
            if failure.is_none() && snapshot.closed_or_error() {
                failure = Some(-libc_consts::ECONNRESET);
            }

            if let Some(code) = failure {
                // The reset pipeline retires the token through our channel; outstanding work
                // items still hold their own references.
                peer.reset(code);
                let _ = connections.remove(&snapshot.token);
            }
        }

        // Nothing progressed and the pools are saturated: park on the gate until queues
        // drain, some socket gains output, or the node exits.
        if processed == 0 && !backpressure.below_limit() {
            if last_suspend_log.elapsed() > Duration::from_secs(1) {
                info!(
                    poller = name,
                    queued = backpressure.queued(),
                    "net poller suspended because io pool queues are full"
                );
                last_suspend_log = Instant::now();
            }
            backpressure.wait_until_ready(POLL_TIMEOUT);
        }
    }
    info!(poller = name, "finished net poller");
}

/// What the acceptor does with a freshly accepted socket; the node wires this to connection
/// creation and poller assignment.
pub trait AcceptHandler: Send + Sync {
    fn handle_accepted(&self, stream: mio::net::TcpStream, peer_addr: SocketAddr);
}

/// Handle of the dedicated acceptor poller thread.
pub struct Acceptor {
    join: Option<JoinHandle<()>>,
    local_addr: SocketAddr,
}

impl Acceptor {
    /// Binds `listen_addr` and spawns the acceptor thread.
    ///
    /// # Errors
    ///
    /// Returns `EddyError::Io` when binding, registration, or spawn fails.
    pub fn spawn(
        listen_addr: SocketAddr,
        server_prio: i32,
        handler: Arc<dyn AcceptHandler>,
        backpressure: Arc<Backpressure>,
        node_exit: Arc<AtomicI32>,
    ) -> EddyResult<Self> {
        let poll =
            Poll::new().map_err(|error| EddyError::Io(format!("create poll failed: {error}")))?;
        let mut listener = TcpListener::bind(listen_addr)
            .map_err(|error| EddyError::Io(format!("bind listener failed: {error}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|error| EddyError::Io(format!("query listener address failed: {error}")))?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
            .map_err(|error| {
                EddyError::Io(format!("register listener in poll failed: {error}"))
            })?;

        let join = thread::Builder::new()
            .name("eddy-acceptor".to_string())
            .spawn(move || {
                acceptor_thread_main(
                    poll,
                    listener,
                    server_prio,
                    &handler,
                    &backpressure,
                    &node_exit,
                );
            })
            .map_err(|error| EddyError::Io(format!("spawn acceptor failed: {error}")))?;
        Ok(Self {
            join: Some(join),
            local_addr,
        })
    }

    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Joins the thread; it exits on its own once the node requests exit.
    pub fn join(&mut self) {
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn acceptor_thread_main(
    mut poll: Poll,
    listener: TcpListener,
    server_prio: i32,
    handler: &Arc<dyn AcceptHandler>,
    backpressure: &Arc<Backpressure>,
    node_exit: &Arc<AtomicI32>,
) {
    info!(addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(), "started acceptor");
    let mut events = Events::with_capacity(EVENT_BUFFER_START);

    while node_exit.load(Ordering::Acquire) == 0 {
        if let Err(poll_error) = poll.poll(&mut events, Some(POLL_TIMEOUT)) {
            if poll_error.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            error!(error = %poll_error, "acceptor failed to wait for events");
            node_exit.store(-poll_error.raw_os_error().unwrap_or(libc_consts::EIO), Ordering::Release);
            backpressure.request_exit();
            break;
        }

        for event in events.iter() {
            if event.token() != LISTENER_TOKEN {
                continue;
            }
            if !accept_ready_connections(&listener, server_prio, handler, node_exit) {
                backpressure.request_exit();
                return;
            }
        }
    }
    info!("finished acceptor");
}

/// Drains the accept queue. Returns false on a fatal accept error.
fn accept_ready_connections(
    listener: &TcpListener,
    server_prio: i32,
    handler: &Arc<dyn AcceptHandler>,
    node_exit: &Arc<AtomicI32>,
) -> bool {
    loop {
        match listener.accept() {
            Ok((stream, peer_addr)) => {
                // Dual-stack listeners deliver IPv4 peers in mapped-IPv6 form.
                let peer_addr = canonicalize(peer_addr);
                let _ = stream.set_nodelay(true);
                sys::set_socket_priority(&stream, server_prio);
                info!(peer = %peer_addr, "accepted client");
                handler.handle_accepted(stream, peer_addr);
            }
            Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => return true,
            Err(error) if error.kind() == std::io::ErrorKind::Interrupted => {}
            Err(error) if accept_error_is_recoverable(&error) => {
                warn!(%error, "recoverable accept failure, will retry");
                return true;
            }
            Err(error) => {
                // Out of the recoverable set: kernel or config breakage no retry will fix.
                error!(%error, "fatal accept failure, stopping node");
                node_exit.store(-error.raw_os_error().unwrap_or(libc_consts::EIO), Ordering::Release);
                return false;
            }
        }
    }
}

/// The accept errno set treated the same way as `EAGAIN`.
fn accept_error_is_recoverable(error: &std::io::Error) -> bool {
    if error.kind() == std::io::ErrorKind::ConnectionAborted {
        return true;
    }
    // EMFILE, ENOBUFS, ENOMEM have no stable ErrorKind mapping.
    matches!(error.raw_os_error(), Some(24 | 105 | 12))
}
