//! Per-peer connection state: the receive state machine, the outbound queue, and the reset
//! pipeline.
//!
//! A [`PeerState`] owns one bidirectional TCP link. The receive parser is only ever advanced
//! by the poller thread the connection is attached to; the outbound queue and the transaction
//! table are guarded by their own locks and may be fed from any thread. Lock order is
//! `io` before `send`; producers release `send` before touching `io`.
//!
//! Reference counting is expressed through `Arc`: the owning poller holds one reference, every
//! in-flight work item and registered transaction callback holds another, so a reset
//! connection stays alive until the last worker releases it.

use std::io::{IoSlice, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Condvar, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant};

use eddy_common::clock::diff_usecs;
use eddy_common::error::{libc_consts, EddyError, EddyResult};
use eddy_common::ids::ObjectId;
use eddy_proto::frame::{flags, FrameHeader, HEADER_SIZE};
use eddy_proto::CommandKind;
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use tracing::{debug, error, info, warn};

use crate::backpressure::Backpressure;
use crate::pool::{IngressSink, IoReq, PostFlags};
use crate::reconnect::ReconnectRegistry;
use crate::transaction::{CallbackOutbox, CompletionCallback, ReplyDisposition, TransactionTable};

/// Producer blocking threshold of the outbound queue, in frames.
pub const SEND_WATERMARK_HIGH: usize = 1024 * 100;
/// Producers blocked on the high watermark are woken when the queue drains to this depth.
pub const SEND_WATERMARK_LOW: usize = 512 * 100;

/// Frames larger than this are treated as malformed; nothing legitimate approaches it.
const MAX_PAYLOAD_SIZE: u64 = 1 << 30;

/// Scratch chunk used to discard payload of malformed frames.
const SKIP_CHUNK: usize = 4096;

/// How this link came to exist; drives reconnect policy after reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinState {
    /// Accepted from a remote client; never reconnected from our side.
    Accepted,
    /// Locally initiated plain connection.
    Connected,
    /// Locally initiated and joined into the storage network.
    Joined,
}

/// A region of a file attached to an outgoing frame, sent after the inline body.
pub struct FileRegion {
    pub file: std::fs::File,
    pub offset: u64,
    pub len: u64,
    pub post: PostFlags,
}

impl Drop for FileRegion {
    fn drop(&mut self) {
        if self.post.contains(PostFlags::UNCACHE) {
            crate::sys::drop_page_cache(&self.file);
        }
    }
}

/// One frame queued for sending: pre-encoded header, optional inline body, optional file
/// region appended via zero-copy where the platform supports it.
pub struct OutgoingFrame {
    header: FrameHeader,
    header_bytes: [u8; HEADER_SIZE],
    body: Vec<u8>,
    region: Option<FileRegion>,
}

impl OutgoingFrame {
    /// Builds a frame whose payload is the inline body; the header size field is stamped here.
    #[must_use]
    pub fn with_body(mut header: FrameHeader, body: Vec<u8>) -> Self {
        header.size = body.len() as u64;
        Self {
            header,
            header_bytes: header.encode(),
            body,
            region: None,
        }
    }

    /// Builds a frame whose payload is an inline prefix followed by a file region.
    #[must_use]
    pub fn with_region(mut header: FrameHeader, body: Vec<u8>, region: FileRegion) -> Self {
        header.size = body.len() as u64 + region.len;
        Self {
            header,
            header_bytes: header.encode(),
            body,
            region: Some(region),
        }
    }

    /// Header-only frame (acknowledgements, empty replies).
    #[must_use]
    pub fn header_only(header: FrameHeader) -> Self {
        Self::with_body(header, Vec::new())
    }

    #[must_use]
    pub fn header(&self) -> &FrameHeader {
        &self.header
    }

    fn inline_len(&self) -> usize {
        HEADER_SIZE + self.body.len()
    }
}

/// Receive parser states. `Skip` discards the payload of a malformed header so framing stays
/// in sync without killing the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecvState {
    Header,
    Body,
    Skip,
}

struct RecvMachine {
    state: RecvState,
    offset: usize,
    header_buf: [u8; HEADER_SIZE],
    header: FrameHeader,
    body: Vec<u8>,
    skip_remaining: u64,
    recv_start: Option<Instant>,
}

impl RecvMachine {
    fn new() -> Self {
        Self {
            state: RecvState::Header,
            offset: 0,
            header_buf: [0; HEADER_SIZE],
            header: FrameHeader::default(),
            body: Vec::new(),
            skip_remaining: 0,
            recv_start: None,
        }
    }

    /// Back to expecting a header; frees the body buffer of the previous frame.
    fn rearm(&mut self) {
        self.state = RecvState::Header;
        self.offset = 0;
        self.body = Vec::new();
        self.skip_remaining = 0;
        self.recv_start = None;
    }
}

struct PeerIo {
    stream: Option<TcpStream>,
    recv: RecvMachine,
    interest: Interest,
}

struct SendQueue {
    queue: std::collections::VecDeque<OutgoingFrame>,
    /// Bytes of the head frame already written; survives partial sends across events.
    head_offset: usize,
}

/// Where this connection is registered: the poller registry, its token, and the channel used
/// to hand the poller's reference back after reset.
pub struct PollerBinding {
    pub registry: Arc<Registry>,
    pub token: Token,
    pub retire_tx: Sender<Token>,
}

/// Per-command traffic counters, snapshot by `MONITOR_STAT`.
pub struct CommandStats {
    counts: [AtomicU64; CommandKind::KNOWN_MAX],
    errors: [AtomicU64; CommandKind::KNOWN_MAX],
}

impl CommandStats {
    fn new() -> Self {
        Self {
            counts: std::array::from_fn(|_| AtomicU64::new(0)),
            errors: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    fn record(&self, command: CommandKind, status: i32) {
        let slot = command.stat_slot();
        let _ = self.counts[slot].fetch_add(1, Ordering::AcqRel);
        if status != 0 {
            let _ = self.errors[slot].fetch_add(1, Ordering::AcqRel);
        }
    }

    /// (count, errors) per command slot.
    #[must_use]
    pub fn snapshot(&self) -> [(u64, u64); CommandKind::KNOWN_MAX] {
        std::array::from_fn(|slot| {
            (
                self.counts[slot].load(Ordering::Acquire),
                self.errors[slot].load(Ordering::Acquire),
            )
        })
    }
}

/// Tunables a connection inherits from its node at creation.
pub struct PeerOptions {
    pub backpressure: Arc<Backpressure>,
    pub reconnects: Option<Arc<ReconnectRegistry>>,
    pub send_limit: u32,
    pub wait_timeout: Duration,
}

/// One bidirectional TCP link to a peer, with its parser, queues, and transactions.
pub struct PeerState {
    /// Back-reference to the owning `Arc`, for handing out work-item references.
    self_ref: Weak<PeerState>,
    addr: SocketAddr,
    local_index: usize,
    join_state: Mutex<JoinState>,
    io: Mutex<PeerIo>,
    send: Mutex<SendQueue>,
    send_wait: Condvar,
    send_queue_size: AtomicUsize,
    trans: TransactionTable,
    need_exit: AtomicI32,
    stall: AtomicU32,
    authenticated: AtomicBool,
    version: Mutex<[i32; 4]>,
    stats: CommandStats,
    binding: OnceLock<PollerBinding>,
    backpressure: Arc<Backpressure>,
    reconnects: Option<Arc<ReconnectRegistry>>,
    send_limit: u32,
    wait_timeout: Duration,
}

impl PeerState {
    #[must_use]
    pub fn new(
        stream: TcpStream,
        addr: SocketAddr,
        local_index: usize,
        join_state: JoinState,
        options: PeerOptions,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            addr,
            local_index,
            join_state: Mutex::new(join_state),
            io: Mutex::new(PeerIo {
                stream: Some(stream),
                recv: RecvMachine::new(),
                interest: Interest::READABLE,
            }),
            send: Mutex::new(SendQueue {
                queue: std::collections::VecDeque::new(),
                head_offset: 0,
            }),
            send_wait: Condvar::new(),
            send_queue_size: AtomicUsize::new(0),
            trans: TransactionTable::new(),
            need_exit: AtomicI32::new(0),
            stall: AtomicU32::new(0),
            authenticated: AtomicBool::new(false),
            version: Mutex::new([0; 4]),
            stats: CommandStats::new(),
            binding: OnceLock::new(),
            backpressure: options.backpressure,
            reconnects: options.reconnects,
            send_limit: options.send_limit,
            wait_timeout: options.wait_timeout,
        })
    }

    fn self_arc(&self) -> Arc<PeerState> {
        self.self_ref
            .upgrade()
            .expect("self reference is alive while any method runs")
    }

    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    #[must_use]
    pub fn local_index(&self) -> usize {
        self.local_index
    }

    #[must_use]
    pub fn join_state(&self) -> JoinState {
        *self.join_state.lock().expect("join state lock poisoned")
    }

    pub fn set_join_state(&self, state: JoinState) {
        *self.join_state.lock().expect("join state lock poisoned") = state;
    }

    /// Sticky error code; non-zero forbids any further scheduling on this connection.
    #[must_use]
    pub fn need_exit(&self) -> i32 {
        self.need_exit.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    pub fn mark_authenticated(&self) {
        self.authenticated.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn version(&self) -> [i32; 4] {
        *self.version.lock().expect("version lock poisoned")
    }

    pub fn set_version(&self, version: [i32; 4]) {
        *self.version.lock().expect("version lock poisoned") = version;
    }

    #[must_use]
    pub fn stats(&self) -> &CommandStats {
        &self.stats
    }

    #[must_use]
    pub fn transactions(&self) -> &TransactionTable {
        &self.trans
    }

    #[must_use]
    pub fn send_queue_len(&self) -> usize {
        self.send_queue_size.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn has_pending_output(&self) -> bool {
        self.send_queue_len() > 0
    }

    /// Attaches this connection to a poller. Called exactly once, by the poller thread, before
    /// the first readiness event can be delivered.
    ///
    /// # Errors
    ///
    /// Returns `EddyError::Io` when socket registration fails.
    pub fn bind_poller(&self, binding: PollerBinding) -> EddyResult<()> {
        let mut io = self.io.lock().expect("peer io lock poisoned");
        let Some(stream) = io.stream.as_mut() else {
            return Err(EddyError::InvalidState("binding a reset connection"));
        };
        let mut interest = Interest::READABLE;
        if self.has_pending_output() {
            interest |= Interest::WRITABLE;
        }
        binding
            .registry
            .register(stream, binding.token, interest)
            .map_err(|error| EddyError::Io(format!("register connection in poll failed: {error}")))?;
        io.interest = interest;
        drop(io);
        if self.binding.set(binding).is_err() {
            return Err(EddyError::InvalidState("connection is already bound"));
        }
        // A producer that queued between the interest snapshot above and the binding becoming
        // visible found no registry to arm; re-check now that it is.
        if self.has_pending_output() {
            self.arm_write();
        }
        Ok(())
    }

    /// Sweep bookkeeping: adds freshly observed stalled transactions, returning the total.
    pub fn note_stalled(&self, stalled: u32) -> u32 {
        self.stall.fetch_add(stalled, Ordering::AcqRel) + stalled
    }

    fn clear_stall(&self) {
        self.stall.store(0, Ordering::Release);
    }

    // ---- outbound path ----

    /// Appends one frame to the outbound FIFO and arms the writable interest.
    ///
    /// With `block` set, the producer waits on the send watermark pair: queue depth at or
    /// above HIGH parks it until the poller drains to LOW or the deadline passes. Poller and
    /// worker threads pass `None`; only request originators block.
    ///
    /// # Errors
    ///
    /// Returns `EddyError::ConnectionReset` on a reset connection and `EddyError::Timeout`
    /// when the watermark wait exceeds the deadline.
    pub fn queue_frame(&self, frame: OutgoingFrame, block: Option<Duration>) -> EddyResult<()> {
        let code = self.need_exit();
        if code != 0 {
            return Err(EddyError::ConnectionReset(code));
        }

        let mut send = self.send.lock().expect("send queue lock poisoned");
        if let Some(timeout) = block {
            let deadline = Instant::now() + timeout;
            while self.send_queue_size.load(Ordering::Acquire) >= SEND_WATERMARK_HIGH {
                let code = self.need_exit();
                if code != 0 {
                    return Err(EddyError::ConnectionReset(code));
                }
                let now = Instant::now();
                if now >= deadline {
                    return Err(EddyError::Timeout);
                }
                let (next, _timeout) = self
                    .send_wait
                    .wait_timeout(send, deadline - now)
                    .expect("send queue lock poisoned");
                send = next;
            }
        }
        // Re-check under the lock: reset clears the queue after setting the code, and a frame
        // slipped in behind that sweep would never be sent or counted down.
        let code = self.need_exit();
        if code != 0 {
            return Err(EddyError::ConnectionReset(code));
        }
        send.queue.push_back(frame);
        let _ = self.send_queue_size.fetch_add(1, Ordering::AcqRel);
        drop(send);

        self.arm_write();
        self.backpressure.notify_writable();
        Ok(())
    }

    /// Registers a transaction and queues the request frame for sending.
    ///
    /// # Errors
    ///
    /// Returns `EddyError::ConnectionReset` on a reset connection; the callback is then
    /// invoked once with the destroy frame before this returns. Watermark timeouts surface as
    /// `EddyError::Timeout` with the same destroy guarantee.
    pub fn send_request(
        &self,
        key: ObjectId,
        command: CommandKind,
        cflags: u64,
        payload: Vec<u8>,
        callback: CompletionCallback,
    ) -> EddyResult<u64> {
        let mut outbox = CallbackOutbox::new();
        let registered = self
            .trans
            .register(key, command, callback, self.need_exit(), &mut outbox);
        let trans_id = match registered {
            Ok(trans_id) => trans_id,
            Err(error) => {
                outbox.flush(&self.trans);
                return Err(error);
            }
        };

        let header = FrameHeader {
            id: key,
            command,
            flags: cflags | flags::NEED_ACK,
            trans: trans_id,
            trace_id: 0,
            backend_id: -1,
            size: payload.len() as u64,
            status: 0,
        };
        debug!(
            peer = %self.addr,
            cmd = command.name(),
            trans = trans_id,
            size = payload.len(),
            "sending request"
        );
        if let Err(error) = self.queue_frame(
            OutgoingFrame::with_body(header, payload),
            Some(self.wait_timeout),
        ) {
            if let Some(trans) = self.trans.remove(trans_id) {
                trans.destroy(error.errno());
            }
            return Err(error);
        }
        Ok(trans_id)
    }

    fn arm_write(&self) {
        let Some(binding) = self.binding.get() else {
            return;
        };
        let mut io = self.io.lock().expect("peer io lock poisoned");
        let PeerIo {
            stream: Some(stream),
            interest,
            ..
        } = &mut *io
        else {
            return;
        };
        let next = Interest::READABLE | Interest::WRITABLE;
        if *interest != next {
            if let Err(error) = binding.registry.reregister(stream, binding.token, next) {
                warn!(peer = %self.addr, %error, "arming writable interest failed");
                return;
            }
            *interest = next;
        }
    }

    /// Drives the outbound queue on a writable event.
    ///
    /// Frames leave in enqueue order; a partially written frame is put back at the head with
    /// its offset preserved. The loop stops on `EAGAIN`, when the queue drains (writable
    /// interest is disarmed), or after `send_limit` frames so one chatty peer cannot hog the
    /// poller.
    ///
    /// # Errors
    ///
    /// Returns `EddyError::ConnectionReset` on hard socket errors.
    pub fn process_writable(&self) -> EddyResult<()> {
        let mut io = self.io.lock().expect("peer io lock poisoned");
        let mut sent_frames = 0_u32;

        loop {
            let (mut frame, mut head_offset) = {
                let mut send = self.send.lock().expect("send queue lock poisoned");
                let Some(frame) = send.queue.pop_front() else {
                    drop(send);
                    self.disarm_write_locked(&mut io);
                    return Ok(());
                };
                let head_offset = send.head_offset;
                send.head_offset = 0;
                (frame, head_offset)
            };

            match self.write_frame(&mut io, &mut frame, &mut head_offset) {
                Ok(true) => {
                    // Fully sent; dropping the frame applies the file-region post hooks.
                    drop(frame);
                    let before = self.send_queue_size.fetch_sub(1, Ordering::AcqRel);
                    if before.saturating_sub(1) == SEND_WATERMARK_LOW {
                        debug!(peer = %self.addr, "send queue reached low watermark, waking producers");
                        self.send_wait.notify_all();
                    }
                    sent_frames += 1;
                    if self.send_limit != 0 && sent_frames >= self.send_limit {
                        debug!(
                            peer = %self.addr,
                            limit = self.send_limit,
                            "per-connection send limit reached, yielding poller"
                        );
                        return Ok(());
                    }
                }
                Ok(false) => {
                    // Kernel buffer full; park the frame back at the head.
                    let mut send = self.send.lock().expect("send queue lock poisoned");
                    send.queue.push_front(frame);
                    send.head_offset = head_offset;
                    return Ok(());
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Writes as much of one frame as the socket accepts. Returns `Ok(true)` when the frame
    /// is fully sent, `Ok(false)` on `EAGAIN`.
    fn write_frame(
        &self,
        io: &mut PeerIo,
        frame: &mut OutgoingFrame,
        head_offset: &mut usize,
    ) -> EddyResult<bool> {
        let Some(stream) = io.stream.as_mut() else {
            return Err(EddyError::ConnectionReset(self.need_exit()));
        };

        // Inline part: header then body, as one scattered write.
        while *head_offset < frame.inline_len() {
            let header_rest = if *head_offset < HEADER_SIZE {
                &frame.header_bytes[*head_offset..]
            } else {
                &[]
            };
            let body_start = head_offset.saturating_sub(HEADER_SIZE);
            let slices = [IoSlice::new(header_rest), IoSlice::new(&frame.body[body_start..])];
            match stream.write_vectored(&slices) {
                Ok(0) => return Err(EddyError::ConnectionReset(-libc_consts::ECONNRESET)),
                Ok(written) => *head_offset += written,
                Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => return Ok(false),
                Err(error) if error.kind() == std::io::ErrorKind::Interrupted => {}
                Err(error) => {
                    return Err(EddyError::ConnectionReset(
                        -error.raw_os_error().unwrap_or(libc_consts::EIO),
                    ))
                }
            }
        }

        // File region after the inline part.
        let inline_len = frame.inline_len();
        if let Some(region) = frame.region.as_mut() {
            let region_sent = (*head_offset - inline_len) as u64;
            let mut remaining = region.len - region_sent;
            while remaining > 0 {
                match send_file_region(stream, region, region.len - remaining) {
                    Ok(0) => return Err(EddyError::ConnectionReset(-libc_consts::ECONNRESET)),
                    Ok(written) => {
                        remaining -= written;
                        *head_offset += written as usize;
                    }
                    Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {
                        return Ok(false)
                    }
                    Err(error) if error.kind() == std::io::ErrorKind::Interrupted => {}
                    Err(error) => {
                        return Err(EddyError::ConnectionReset(
                            -error.raw_os_error().unwrap_or(libc_consts::EIO),
                        ))
                    }
                }
            }
        }
        Ok(true)
    }

    fn disarm_write_locked(&self, io: &mut PeerIo) {
        let Some(binding) = self.binding.get() else {
            return;
        };
        let PeerIo {
            stream: Some(stream),
            interest,
            ..
        } = &mut *io
        else {
            return;
        };
        if *interest != Interest::READABLE {
            if binding
                .registry
                .reregister(stream, binding.token, Interest::READABLE)
                .is_ok()
            {
                *interest = Interest::READABLE;
            }
        }
    }

    // ---- inbound path ----

    /// Drives the receive state machine on a readable event: reads until `EAGAIN`, parsing
    /// headers and bodies and dispatching every completed frame. Replies are matched against
    /// the transaction table; requests go to `sink`. Completion callbacks collected during the
    /// loop run after the io lock is released.
    ///
    /// # Errors
    ///
    /// Returns `EddyError::ConnectionReset` on peer close or hard socket errors; the caller
    /// runs the reset pipeline.
    pub fn process_readable(&self, sink: &dyn IngressSink) -> EddyResult<()> {
        let mut outbox = CallbackOutbox::new();
        let result = self.read_loop(sink, &mut outbox);
        if !outbox.is_empty() {
            outbox.flush(&self.trans);
        }
        result
    }

    fn read_loop(&self, sink: &dyn IngressSink, outbox: &mut CallbackOutbox) -> EddyResult<()> {
        let mut io = self.io.lock().expect("peer io lock poisoned");
        let PeerIo {
            stream: maybe_stream,
            recv,
            ..
        } = &mut *io;
        let Some(stream) = maybe_stream.as_mut() else {
            return Err(EddyError::ConnectionReset(self.need_exit()));
        };

        loop {
            match recv.state {
                RecvState::Header => {
                    let first_byte = recv.offset == 0;
                    match stream.read(&mut recv.header_buf[recv.offset..]) {
                        Ok(0) => {
                            info!(peer = %self.addr, "peer has disconnected");
                            return Err(EddyError::ConnectionReset(-libc_consts::ECONNRESET));
                        }
                        Ok(read_len) => {
                            if first_byte {
                                recv.recv_start = Some(Instant::now());
                            }
                            recv.offset += read_len;
                        }
                        Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {
                            return Ok(())
                        }
                        Err(error) if error.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(error) => {
                            error!(peer = %self.addr, %error, "failed to receive data");
                            return Err(EddyError::ConnectionReset(
                                -error.raw_os_error().unwrap_or(libc_consts::EIO),
                            ));
                        }
                    }
                    if recv.offset < HEADER_SIZE {
                        continue;
                    }

                    match FrameHeader::parse(&recv.header_buf) {
                        Ok(header) if header.size > MAX_PAYLOAD_SIZE => {
                            error!(
                                peer = %self.addr,
                                size = header.size,
                                "dropping frame with absurd payload size"
                            );
                            recv.skip_remaining = header.size;
                            recv.state = RecvState::Skip;
                            recv.offset = 0;
                        }
                        Ok(header) => {
                            recv.header = header;
                            if header.size == 0 {
                                self.dispatch_frame(header, Vec::new(), recv.recv_start, sink, outbox);
                                recv.rearm();
                            } else {
                                recv.body = vec![0; header.size as usize];
                                recv.state = RecvState::Body;
                                recv.offset = 0;
                            }
                        }
                        Err(frame_error) => {
                            // Malformed header: permissive policy, the connection stays up and
                            // the payload is discarded to preserve framing.
                            error!(peer = %self.addr, error = %frame_error, "malformed frame header");
                            recv.skip_remaining = FrameHeader::peek_size(&recv.header_buf);
                            recv.state = RecvState::Skip;
                            recv.offset = 0;
                        }
                    }
                }
                RecvState::Body => {
                    let end = recv.body.len();
                    match stream.read(&mut recv.body[recv.offset..end]) {
                        Ok(0) => {
                            info!(peer = %self.addr, "peer has disconnected mid-frame");
                            return Err(EddyError::ConnectionReset(-libc_consts::ECONNRESET));
                        }
                        Ok(read_len) => recv.offset += read_len,
                        Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {
                            return Ok(())
                        }
                        Err(error) if error.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(error) => {
                            error!(peer = %self.addr, %error, "failed to receive data");
                            return Err(EddyError::ConnectionReset(
                                -error.raw_os_error().unwrap_or(libc_consts::EIO),
                            ));
                        }
                    }
                    if recv.offset < end {
                        continue;
                    }
                    let header = recv.header;
                    let body = std::mem::take(&mut recv.body);
                    let started = recv.recv_start;
                    self.dispatch_frame(header, body, started, sink, outbox);
                    recv.rearm();
                }
                RecvState::Skip => {
                    let mut scratch = [0_u8; SKIP_CHUNK];
                    let want = (recv.skip_remaining as usize).min(SKIP_CHUNK);
                    if want == 0 {
                        recv.rearm();
                        continue;
                    }
                    match stream.read(&mut scratch[..want]) {
                        Ok(0) => {
                            return Err(EddyError::ConnectionReset(-libc_consts::ECONNRESET))
                        }
                        Ok(read_len) => recv.skip_remaining -= read_len as u64,
                        Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {
                            return Ok(())
                        }
                        Err(error) if error.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(error) => {
                            return Err(EddyError::ConnectionReset(
                                -error.raw_os_error().unwrap_or(libc_consts::EIO),
                            ))
                        }
                    }
                    if recv.skip_remaining == 0 {
                        recv.rearm();
                    }
                }
            }
        }
    }

    /// Routes one completed frame: replies demux against the transaction table, requests are
    /// packaged into work items and fed to the ingress sink.
    fn dispatch_frame(
        &self,
        header: FrameHeader,
        payload: Vec<u8>,
        started: Option<Instant>,
        sink: &dyn IngressSink,
        outbox: &mut CallbackOutbox,
    ) {
        let recv_time_usecs = started.map_or(0, |start| diff_usecs(start, Instant::now()));
        self.stats.record(header.command, header.status);
        self.clear_stall();

        debug!(
            peer = %self.addr,
            id = %header.id.dump(),
            cmd = header.command.name(),
            trans = header.trans,
            size = header.size,
            reply = header.is_reply(),
            trace = header.trace_id,
            recv_usecs = recv_time_usecs,
            "received frame"
        );

        if header.is_reply() {
            match self.trans.match_reply(&header, &payload, outbox) {
                ReplyDisposition::Unknown => {
                    debug!(
                        peer = %self.addr,
                        trans = header.trans,
                        "dropping reply for unknown transaction"
                    );
                }
                ReplyDisposition::Matched { .. } => {}
            }
            return;
        }

        let req = IoReq::new(header, payload, self.self_arc(), recv_time_usecs);
        if let Err(error) = sink.ingest(req) {
            warn!(peer = %self.addr, %error, "failed to schedule inbound request");
        }
    }

    // ---- reset pipeline ----

    /// Tears this connection down with a sticky error code.
    ///
    /// Safe to call from any thread and any number of times; only the first call acts. The
    /// pipeline unschedules and closes the socket, destroys every outstanding transaction with
    /// `code`, clears the outbound queue, wakes blocked producers, schedules a reconnect for
    /// locally initiated links, and hands the poller its reference back.
    pub fn reset(&self, code: i32) {
        let code = if code == 0 { -libc_consts::EIO } else { code };
        if self
            .need_exit
            .compare_exchange(0, code, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        warn!(peer = %self.addr, code, "resetting connection");

        {
            let mut io = self.io.lock().expect("peer io lock poisoned");
            if let Some(mut stream) = io.stream.take() {
                if let Some(binding) = self.binding.get() {
                    let _ = binding.registry.deregister(&mut stream);
                }
            }
        }

        // Destroy callbacks run outside every lock; they may re-enter node APIs.
        let drained = self.trans.drain();
        if !drained.is_empty() {
            info!(
                peer = %self.addr,
                count = drained.len(),
                "destroying outstanding transactions"
            );
        }
        for trans in &drained {
            trans.destroy(code);
        }

        {
            let mut send = self.send.lock().expect("send queue lock poisoned");
            send.queue.clear();
            send.head_offset = 0;
        }
        self.send_queue_size.store(0, Ordering::Release);
        self.send_wait.notify_all();

        if let Some(reconnects) = &self.reconnects {
            let join_state = self.join_state();
            if join_state != JoinState::Accepted {
                reconnects.register(self.addr, join_state);
            }
        }

        if let Some(binding) = self.binding.get() {
            let _ = binding.retire_tx.send(binding.token);
        }
        self.backpressure.notify_writable();
    }
}

/// Sends part of a file region over the socket. Linux uses `sendfile`; elsewhere a buffered
/// copy with positional reads keeps the behavior identical.
#[cfg(target_os = "linux")]
fn send_file_region(
    stream: &mut TcpStream,
    region: &FileRegion,
    region_offset: u64,
) -> std::io::Result<u64> {
    use std::os::fd::AsRawFd;

    let mut file_offset = (region.offset + region_offset) as libc::off_t;
    let count = (region.len - region_offset) as usize;
    let sent = unsafe {
        libc::sendfile(
            stream.as_raw_fd(),
            region.file.as_raw_fd(),
            &mut file_offset,
            count,
        )
    };
    if sent < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(sent as u64)
}

#[cfg(all(unix, not(target_os = "linux")))]
fn send_file_region(
    stream: &mut TcpStream,
    region: &FileRegion,
    region_offset: u64,
) -> std::io::Result<u64> {
    use std::os::unix::fs::FileExt;

    const FILE_CHUNK: usize = 64 * 1024;
    let mut chunk = [0_u8; FILE_CHUNK];
    let want = ((region.len - region_offset) as usize).min(FILE_CHUNK);
    let read_len = region
        .file
        .read_at(&mut chunk[..want], region.offset + region_offset)?;
    if read_len == 0 {
        return Ok(0);
    }
    let written = stream.write(&chunk[..read_len])?;
    Ok(written as u64)
}
