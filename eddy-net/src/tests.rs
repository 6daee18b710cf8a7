//! End-to-end engine tests over real loopback sockets.

use std::io::{Read, Write};
use std::net::TcpStream as StdTcpStream;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use eddy_common::config::NodeConfig;
use eddy_common::error::libc_consts;
use eddy_common::ids::ObjectId;
use eddy_proto::frame::{flags, FrameHeader, HEADER_SIZE};
use eddy_proto::CommandKind;
use googletest::prelude::*;
use mio::net::TcpStream;
use mio::Token;
use rstest::rstest;

use crate::backpressure::Backpressure;
use crate::dispatch::{Dispatcher, EmptyRouteTable, RouteOpts};
use crate::poller::{AcceptHandler, Acceptor, EventSnapshot, NetPoller, PollerHandle};
use crate::pool::{IoReq, PoolDiscipline, PoolManager, PoolPlace, PushOutcome, RequestProcessor, WorkPool};
use crate::state::{FileRegion, JoinState, OutgoingFrame, PeerOptions, PeerState};

const ECHO_CMD: u32 = 42;

fn test_config() -> NodeConfig {
    NodeConfig::default().normalized()
}

fn peer_options(backpressure: &Arc<Backpressure>) -> PeerOptions {
    PeerOptions {
        backpressure: Arc::clone(backpressure),
        reconnects: None,
        send_limit: 0,
        wait_timeout: Duration::from_secs(5),
    }
}

/// Replies `PONG` to every request and acknowledges it, mirroring a storage handler.
struct EchoProcessor;

impl RequestProcessor for EchoProcessor {
    fn process(&self, req: IoReq) {
        let reply = FrameHeader {
            id: req.header.id,
            command: req.header.command,
            flags: flags::REPLY,
            trans: req.header.trans,
            trace_id: req.header.trace_id,
            backend_id: req.header.backend_id,
            size: 0,
            status: 0,
        };
        let _ = req
            .peer
            .queue_frame(OutgoingFrame::with_body(reply, b"PONG".to_vec()), None);
        if req.header.has_flag(flags::NEED_ACK) {
            let ack = FrameHeader::destroy_sentinel(req.header.trans, 0);
            let _ = req.peer.queue_frame(OutgoingFrame::header_only(ack), None);
        }
        req.release();
    }
}

/// Counts requests, optionally sleeping per item to keep queues deep.
struct CountingProcessor {
    processed: Arc<AtomicUsize>,
    delay: Duration,
}

impl RequestProcessor for CountingProcessor {
    fn process(&self, req: IoReq) {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        let _ = self.processed.fetch_add(1, Ordering::AcqRel);
        req.release();
    }
}

struct TestAccept {
    poller: PollerHandle,
    backpressure: Arc<Backpressure>,
}

impl AcceptHandler for TestAccept {
    fn handle_accepted(&self, stream: TcpStream, peer_addr: std::net::SocketAddr) {
        let peer = PeerState::new(
            stream,
            peer_addr,
            0,
            JoinState::Accepted,
            peer_options(&self.backpressure),
        );
        self.poller.attach(peer).expect("poller must accept connections");
    }
}

/// A miniature node: one poller, one acceptor, one system place feeding `processor`.
struct EngineHarness {
    backpressure: Arc<Backpressure>,
    pools: Arc<PoolManager>,
    poller: NetPoller,
    acceptor: Acceptor,
    node_exit: Arc<AtomicI32>,
}

impl EngineHarness {
    fn spawn(processor: Arc<dyn RequestProcessor>, workers: usize) -> Self {
        let backpressure = Arc::new(Backpressure::new());
        let node_exit = Arc::new(AtomicI32::new(0));

        let place = Arc::new(PoolPlace {
            blocking: WorkPool::new(
                PoolDiscipline::Blocking,
                "sys".to_string(),
                0,
                Arc::clone(&backpressure),
                Arc::clone(&processor),
                None,
            ),
            nonblocking: WorkPool::new(
                PoolDiscipline::NonBlocking,
                "sys".to_string(),
                0,
                Arc::clone(&backpressure),
                Arc::clone(&processor),
                None,
            ),
        });
        place
            .blocking
            .grow(workers)
            .expect("pool workers must spawn");
        let pools = Arc::new(PoolManager::new(place));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&pools),
            Arc::new(EmptyRouteTable),
            RouteOpts::default(),
        ));

        let poller = NetPoller::spawn(
            "test-net".to_string(),
            dispatcher,
            Arc::clone(&backpressure),
            Arc::clone(&node_exit),
        )
        .expect("poller must spawn");

        let acceptor = Acceptor::spawn(
            "127.0.0.1:0".parse().expect("literal address must parse"),
            0,
            Arc::new(TestAccept {
                poller: poller.handle(),
                backpressure: Arc::clone(&backpressure),
            }),
            Arc::clone(&backpressure),
            Arc::clone(&node_exit),
        )
        .expect("acceptor must spawn");

        Self {
            backpressure,
            pools,
            poller,
            acceptor,
            node_exit,
        }
    }

    fn listen_addr(&self) -> std::net::SocketAddr {
        self.acceptor.local_addr()
    }

    /// Client-side connection driven by the same poller.
    fn connect_client(&self) -> Arc<PeerState> {
        let std_stream = StdTcpStream::connect(self.listen_addr()).expect("connect must succeed");
        std_stream
            .set_nonblocking(true)
            .expect("nonblocking client must be configurable");
        let addr = std_stream.peer_addr().expect("peer addr must resolve");
        let stream = TcpStream::from_std(std_stream);
        let peer = PeerState::new(
            stream,
            addr,
            0,
            JoinState::Connected,
            peer_options(&self.backpressure),
        );
        self.poller
            .attach(Arc::clone(&peer))
            .expect("poller must accept the client");
        peer
    }
}

impl Drop for EngineHarness {
    fn drop(&mut self) {
        self.node_exit.store(1, Ordering::Release);
        self.backpressure.request_exit();
        self.poller.shutdown();
        self.acceptor.join();
        self.pools.shutdown();
    }
}

/// Runs a deadline loop until `probe` yields a value.
fn wait_for<T>(deadline: Duration, mut probe: impl FnMut() -> Option<T>) -> Option<T> {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if let Some(value) = probe() {
            return Some(value);
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    None
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CallbackRecord {
    destroy: bool,
    status: i32,
    payload: Vec<u8>,
}

fn recording_callback(events: mpsc::Sender<CallbackRecord>) -> crate::transaction::CompletionCallback {
    Box::new(move |header: &FrameHeader, payload: &[u8]| {
        let _ = events.send(CallbackRecord {
            destroy: header.has_flag(flags::DESTROY),
            status: header.status,
            payload: payload.to_vec(),
        });
    })
}

#[rstest]
fn echo_roundtrip_invokes_callback_twice_with_terminal_destroy() {
    let harness = EngineHarness::spawn(Arc::new(EchoProcessor), 2);
    let client = harness.connect_client();
    let (events_tx, events_rx) = mpsc::channel();

    let trans = client
        .send_request(
            ObjectId::default(),
            CommandKind::from_code(ECHO_CMD),
            0,
            b"PING".to_vec(),
            recording_callback(events_tx),
        )
        .expect("request must queue");
    assert_that!(trans, eq(1));

    let first = events_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("reply must arrive");
    assert_that!(first.destroy, eq(false));
    assert_that!(&first.payload, eq(&b"PONG".to_vec()));

    let second = events_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("destroy must follow the reply");
    assert_that!(second.destroy, eq(true));
    assert_that!(second.status, eq(0));

    // The wire acknowledgement targets an already finished transaction and must be dropped.
    let extra = events_rx.recv_timeout(Duration::from_millis(300));
    assert_that!(extra.is_err(), eq(true));
    assert_that!(client.transactions().is_empty(), eq(true));
}

#[rstest]
fn transaction_ids_are_monotonic_per_connection() {
    let harness = EngineHarness::spawn(Arc::new(EchoProcessor), 1);
    let client = harness.connect_client();
    let (events_tx, _events_rx) = mpsc::channel();

    let first = client
        .send_request(
            ObjectId::default(),
            CommandKind::Status,
            0,
            Vec::new(),
            recording_callback(events_tx.clone()),
        )
        .expect("request must queue");
    let second = client
        .send_request(
            ObjectId::default(),
            CommandKind::Status,
            0,
            Vec::new(),
            recording_callback(events_tx),
        )
        .expect("request must queue");
    assert_that!(second, eq(first + 1));
}

#[rstest]
fn malformed_header_is_dropped_and_connection_survives() {
    let harness = EngineHarness::spawn(Arc::new(EchoProcessor), 1);
    let mut client =
        StdTcpStream::connect(harness.listen_addr()).expect("connect must succeed");

    // Frame one: reserved flag bit set, 4-byte payload the server must skip.
    let mut bad = FrameHeader {
        command: CommandKind::from_code(ECHO_CMD),
        size: 4,
        trans: 7,
        ..FrameHeader::default()
    }
    .encode();
    bad[31] = 0x80;
    client.write_all(&bad).expect("write must succeed");
    client.write_all(b"JUNK").expect("write must succeed");

    // Frame two: valid echo request on the same connection.
    let good = FrameHeader {
        command: CommandKind::from_code(ECHO_CMD),
        flags: flags::NEED_ACK,
        trans: 8,
        size: 4,
        ..FrameHeader::default()
    };
    client.write_all(&good.encode()).expect("write must succeed");
    client.write_all(b"PING").expect("write must succeed");

    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("read timeout must be configurable");
    let mut header_bytes = [0_u8; HEADER_SIZE];
    client
        .read_exact(&mut header_bytes)
        .expect("reply header must arrive");
    let reply = FrameHeader::parse(&header_bytes).expect("reply must parse");
    assert_that!(reply.trans, eq(8));
    assert_that!(reply.is_reply(), eq(true));
    assert_that!(reply.size, eq(4));
    let mut payload = [0_u8; 4];
    client.read_exact(&mut payload).expect("payload must arrive");
    assert_that!(&payload, eq(b"PONG"));
}

#[rstest]
fn peer_close_mid_reply_destroys_transaction_with_connreset() {
    // Raw server: accepts one connection, reads the request, replies with a truncated header
    // and closes, so the client parser dies mid-frame.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind must succeed");
    let server_addr = listener.local_addr().expect("local addr must resolve");
    let server = std::thread::spawn(move || {
        let (mut sock, _addr) = listener.accept().expect("accept must succeed");
        let mut request = vec![0_u8; HEADER_SIZE + 4];
        sock.read_exact(&mut request).expect("request must arrive");
        let reply = FrameHeader {
            flags: flags::REPLY,
            trans: 1,
            size: 4,
            ..FrameHeader::default()
        };
        let encoded = reply.encode();
        sock.write_all(&encoded[..HEADER_SIZE / 2])
            .expect("partial write must succeed");
        // Closing here leaves the client inside ReadingHeader with a partial buffer.
    });

    let harness = EngineHarness::spawn(Arc::new(EchoProcessor), 1);
    let std_stream = StdTcpStream::connect(server_addr).expect("connect must succeed");
    std_stream
        .set_nonblocking(true)
        .expect("nonblocking client must be configurable");
    let stream = TcpStream::from_std(std_stream);
    let client = PeerState::new(
        stream,
        server_addr,
        0,
        JoinState::Connected,
        peer_options(&harness.backpressure),
    );
    harness
        .poller
        .attach(Arc::clone(&client))
        .expect("poller must accept the client");

    let (events_tx, events_rx) = mpsc::channel();
    let _trans = client
        .send_request(
            ObjectId::default(),
            CommandKind::from_code(ECHO_CMD),
            0,
            b"PING".to_vec(),
            recording_callback(events_tx),
        )
        .expect("request must queue");

    let record = events_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("destroy must arrive after reset");
    assert_that!(record.destroy, eq(true));
    assert_that!(record.status, eq(-libc_consts::ECONNRESET));
    assert_that!(client.need_exit(), eq(-libc_consts::ECONNRESET));

    let extra = events_rx.recv_timeout(Duration::from_millis(300));
    assert_that!(extra.is_err(), eq(true));
    server.join().expect("raw server must finish");
}

#[rstest]
fn backpressure_blocks_ingress_and_drains_without_losing_frames() {
    let processed = Arc::new(AtomicUsize::new(0));
    let processor = Arc::new(CountingProcessor {
        processed: Arc::clone(&processed),
        delay: Duration::from_micros(200),
    });
    // One blocking worker (plus the idle nonblocking pool worker below) keeps the queue
    // ratio limit small enough to trip with a few thousand frames.
    let harness = EngineHarness::spawn(processor, 1);
    let total_workers = 1;
    let limit = (total_workers as u64) * crate::backpressure::QUEUE_RATIO_PER_WORKER;

    let mut client =
        StdTcpStream::connect(harness.listen_addr()).expect("connect must succeed");
    let frame_count = (limit as usize) * 4;
    let header = FrameHeader {
        command: CommandKind::from_code(ECHO_CMD),
        ..FrameHeader::default()
    }
    .encode();
    for _ in 0..frame_count {
        client.write_all(&header).expect("write must succeed");
    }

    // The gate must engage at some point while the backlog exceeds the ratio limit.
    let blocked = wait_for(Duration::from_secs(10), || {
        if harness.backpressure.is_blocked() {
            Some(())
        } else {
            None
        }
    });
    assert_that!(blocked.is_some(), eq(true));

    // And every injected frame must still be processed once the queues drain.
    let drained = wait_for(Duration::from_secs(30), || {
        if processed.load(Ordering::Acquire) == frame_count {
            Some(())
        } else {
            None
        }
    });
    assert_that!(drained.is_some(), eq(true));
    assert_that!(harness.backpressure.queued(), eq(0));
}

#[rstest]
fn shuffle_visits_every_position_without_order_bias() {
    // Scaled-down order half of the two-connection fairness scenario: the full version
    // drives two peers for 10 000 epoll cycles and chi-square-tests which is serviced
    // first. A black-box run cannot control when the kernel batches two readiness events
    // into one poll return, so the order statistic is checked here directly against the
    // permutation the poller applies to every batch: across 1000 rounds the first token
    // must land in every slot, and its first-place share must stay near uniform. The
    // rate half of the invariant is covered end to end by
    // `competing_connections_drain_with_bounded_service_imbalance`.
    let mut seen = [false; 8];
    let mut first_place = 0_u32;
    const ROUNDS: u32 = 1000;
    for _ in 0..ROUNDS {
        let mut events = (0..8)
            .map(|index| EventSnapshot::for_token(Token(index)))
            .collect::<Vec<_>>();
        crate::poller::shuffle_events(&mut events);
        let position = events
            .iter()
            .position(|event| event.token == Token(0))
            .expect("token must survive the shuffle");
        seen[position] = true;
        if position == 0 {
            first_place += 1;
        }
    }
    assert_that!(seen.iter().all(|hit| *hit), eq(true));
    // Uniform expectation is 125 of 1000; the band is several standard deviations wide,
    // matching the scenario's p > 0.01 tolerance, while readiness-FIFO order would score
    // 1000 and never fail to.
    assert_that!(first_place > 75, eq(true));
    assert_that!(first_place < 185, eq(true));
}

#[rstest]
fn competing_connections_drain_with_bounded_service_imbalance() {
    // Scaled-down rate half of the two-connection fairness scenario, reduced the same way
    // the backpressure test scales its frame counts: two peers offer 1000 frames each in
    // paced bursts against one slow worker, instead of one frame per cycle for 10 000
    // cycles. The processed sequence must never let one peer run away from the other:
    // a poller that serviced readiness in arrival order until a connection drained
    // completely would show an imbalance near the full per-peer count.
    const BURSTS: usize = 100;
    const BURST_FRAMES: usize = 10;
    const PER_PEER: usize = BURSTS * BURST_FRAMES;

    struct GroupOrderProcessor {
        order: Arc<std::sync::Mutex<Vec<u32>>>,
        delay: Duration,
    }
    impl RequestProcessor for GroupOrderProcessor {
        fn process(&self, req: IoReq) {
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
            self.order
                .lock()
                .expect("order lock poisoned")
                .push(req.header.id.group_id);
            req.release();
        }
    }

    let order = Arc::new(std::sync::Mutex::new(Vec::<u32>::new()));
    let harness = EngineHarness::spawn(
        Arc::new(GroupOrderProcessor {
            order: Arc::clone(&order),
            delay: Duration::from_micros(100),
        }),
        1,
    );
    let addr = harness.listen_addr();

    // Connect up front and release both writers from a barrier, so connect latency or
    // thread start skew cannot masquerade as poller unfairness.
    let start = Arc::new(std::sync::Barrier::new(2));
    let spawn_writer = |group: u32| {
        let mut sock = StdTcpStream::connect(addr).expect("connect must succeed");
        let start = Arc::clone(&start);
        let frame = FrameHeader {
            id: ObjectId::new([group as u8; 16], group),
            command: CommandKind::from_code(ECHO_CMD),
            ..FrameHeader::default()
        }
        .encode();
        std::thread::spawn(move || {
            start.wait();
            for _ in 0..BURSTS {
                for _ in 0..BURST_FRAMES {
                    sock.write_all(&frame).expect("write must succeed");
                }
                std::thread::sleep(Duration::from_millis(1));
            }
            sock
        })
    };
    let writer_one = spawn_writer(1);
    let writer_two = spawn_writer(2);
    let _sock_one = writer_one.join().expect("writer must finish");
    let _sock_two = writer_two.join().expect("writer must finish");

    let drained = wait_for(Duration::from_secs(30), || {
        if order.lock().expect("order lock poisoned").len() == PER_PEER * 2 {
            Some(())
        } else {
            None
        }
    });
    assert_that!(drained.is_some(), eq(true));

    let order = order.lock().expect("order lock poisoned");
    let mut balance = 0_i64;
    let mut max_imbalance = 0_i64;
    let mut served_one = 0_usize;
    for group in order.iter() {
        balance += if *group == 1 { 1 } else { -1 };
        max_imbalance = max_imbalance.max(balance.abs());
    }
    for group in order.iter() {
        if *group == 1 {
            served_one += 1;
        }
    }
    // No frames lost on either side, and at no point did one peer get a half-run ahead.
    assert_that!(served_one, eq(PER_PEER));
    assert_that!(order.len() - served_one, eq(PER_PEER));
    assert_that!(max_imbalance < (PER_PEER as i64) / 2, eq(true));
}

#[rstest]
fn bounded_pool_rejects_overflow_and_keeps_earlier_items() {
    let processed = Arc::new(AtomicUsize::new(0));
    let processor = Arc::new(CountingProcessor {
        processed: Arc::clone(&processed),
        delay: Duration::from_millis(50),
    });
    let backpressure = Arc::new(Backpressure::new());
    let pool = WorkPool::new(
        PoolDiscipline::Blocking,
        "bounded".to_string(),
        1,
        Arc::clone(&backpressure),
        processor,
        None,
    );

    let harness = EngineHarness::spawn(Arc::new(EchoProcessor), 1);
    let client = harness.connect_client();
    let make_req = || {
        IoReq::new(
            FrameHeader::default(),
            Vec::new(),
            Arc::clone(&client),
            0,
        )
    };

    // No workers yet: the single slot fills, the next push must be refused.
    assert_that!(matches!(pool.push(make_req()), PushOutcome::Queued), eq(true));
    match pool.push(make_req()) {
        PushOutcome::PoolFull(req) => req.release(),
        PushOutcome::Queued | PushOutcome::ShuttingDown(_) => {
            panic!("push into a full bounded queue must be refused")
        }
    }

    pool.grow(1).expect("worker must spawn");
    let drained = wait_for(Duration::from_secs(5), || {
        if processed.load(Ordering::Acquire) == 1 {
            Some(())
        } else {
            None
        }
    });
    assert_that!(drained.is_some(), eq(true));
    pool.shutdown();
}

#[rstest]
fn lifo_pool_services_most_recent_item_first() {
    let order = Arc::new(std::sync::Mutex::new(Vec::<u64>::new()));

    struct OrderProcessor {
        order: Arc<std::sync::Mutex<Vec<u64>>>,
    }
    impl RequestProcessor for OrderProcessor {
        fn process(&self, req: IoReq) {
            self.order
                .lock()
                .expect("order lock poisoned")
                .push(req.header.trans);
            req.release();
        }
    }

    let backpressure = Arc::new(Backpressure::new());
    let pool = WorkPool::new(
        PoolDiscipline::Lifo,
        "lifo".to_string(),
        0,
        Arc::clone(&backpressure),
        Arc::new(OrderProcessor {
            order: Arc::clone(&order),
        }),
        None,
    );

    let harness = EngineHarness::spawn(Arc::new(EchoProcessor), 1);
    let client = harness.connect_client();
    for trans in 1..=3_u64 {
        let header = FrameHeader {
            trans,
            ..FrameHeader::default()
        };
        let outcome = pool.push(IoReq::new(header, Vec::new(), Arc::clone(&client), 0));
        assert_that!(matches!(outcome, PushOutcome::Queued), eq(true));
    }

    // Workers start only now, so the stack order is fully observable.
    pool.grow(1).expect("worker must spawn");
    let drained = wait_for(Duration::from_secs(5), || {
        let order = order.lock().expect("order lock poisoned");
        if order.len() == 3 {
            Some(order.clone())
        } else {
            None
        }
    });
    let order = drained.expect("all items must be processed");
    assert_that!(&order, eq(&vec![3, 2, 1]));
    pool.shutdown();
}

#[rstest]
fn file_region_frame_accounts_for_inline_and_region_bytes() {
    let path = std::env::temp_dir().join(format!("eddy-region-{}", std::process::id()));
    std::fs::write(&path, b"0123456789").expect("temp file must be writable");
    let file = std::fs::File::open(&path).expect("temp file must open");
    let region = FileRegion {
        file,
        offset: 2,
        len: 6,
        post: crate::pool::PostFlags::default(),
    };
    let frame = OutgoingFrame::with_region(FrameHeader::default(), b"ab".to_vec(), region);
    assert_that!(frame.header().size, eq(8));
    let _ = std::fs::remove_file(&path);
}

#[rstest]
fn reset_connection_refuses_new_requests_after_destroying_pending() {
    let harness = EngineHarness::spawn(Arc::new(EchoProcessor), 1);
    let client = harness.connect_client();
    let (events_tx, events_rx) = mpsc::channel();

    client.reset(-libc_consts::ETIMEDOUT);

    let result = client.send_request(
        ObjectId::default(),
        CommandKind::Status,
        0,
        Vec::new(),
        recording_callback(events_tx),
    );
    assert_that!(result.is_err(), eq(true));

    // The refused registration still owes its callback a destroy frame.
    let record = events_rx
        .recv_timeout(Duration::from_secs(1))
        .expect("destroy must be delivered");
    assert_that!(record.destroy, eq(true));
    assert_that!(record.status, eq(-libc_consts::ETIMEDOUT));
}

#[rstest]
fn silent_server_stalls_transaction_until_sweep_resets_it() {
    // Raw server that accepts the connection, reads the request, and never replies.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind must succeed");
    let server_addr = listener.local_addr().expect("local addr must resolve");
    let server = std::thread::spawn(move || {
        let (mut sock, _addr) = listener.accept().expect("accept must succeed");
        let mut request = vec![0_u8; HEADER_SIZE];
        let _ = sock.read_exact(&mut request);
        std::thread::sleep(Duration::from_secs(3));
    });

    let harness = EngineHarness::spawn(Arc::new(EchoProcessor), 1);
    let std_stream = StdTcpStream::connect(server_addr).expect("connect must succeed");
    std_stream
        .set_nonblocking(true)
        .expect("nonblocking client must be configurable");
    let stream = TcpStream::from_std(std_stream);
    let client = PeerState::new(
        stream,
        server_addr,
        0,
        JoinState::Connected,
        peer_options(&harness.backpressure),
    );
    harness
        .poller
        .attach(Arc::clone(&client))
        .expect("poller must accept the client");

    let (events_tx, events_rx) = mpsc::channel();
    let _trans = client
        .send_request(
            ObjectId::default(),
            CommandKind::from_code(ECHO_CMD),
            0,
            Vec::new(),
            recording_callback(events_tx),
        )
        .expect("request must queue");

    // Fresh transaction: not stalled against a generous timeout.
    let fresh = client
        .transactions()
        .stalled_count(Instant::now(), Duration::from_secs(60));
    assert_that!(fresh, eq(0));

    // Against a sub-millisecond timeout the same transaction counts as stalled; three sweeps
    // push the connection over the configured limit and reset it with a timeout code.
    let config = test_config();
    std::thread::sleep(Duration::from_millis(20));
    for _ in 0..config.stall_count {
        let stalled = client
            .transactions()
            .stalled_count(Instant::now(), Duration::from_millis(1));
        assert_that!(stalled, eq(1));
        let total = client.note_stalled(stalled as u32);
        if total >= config.stall_count {
            client.reset(-libc_consts::ETIMEDOUT);
        }
    }

    let record = events_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("destroy must arrive after the stall reset");
    assert_that!(record.destroy, eq(true));
    assert_that!(record.status, eq(-libc_consts::ETIMEDOUT));
    assert_that!(client.need_exit(), eq(-libc_consts::ETIMEDOUT));
    server.join().expect("raw server must finish");
}
