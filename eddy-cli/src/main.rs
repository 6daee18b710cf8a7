//! Reference I/O client.
//!
//! Drives one remote node through the same engine the server uses: a client-only node with
//! pollers and pools but no listener. Operations run in the order given on the command line;
//! the process exit code is the negated errno of the first failing operation, zero on success.

use std::fs;
use std::sync::mpsc;
use std::time::Duration;

use clap::Parser;
use eddy_common::addr::parse_addr;
use eddy_common::config::NodeConfig;
use eddy_common::error::{EddyError, EddyResult};
use eddy_common::ids::ObjectId;
use eddy_net::state::{JoinState, PeerState};
use eddy_proto::frame::flags;
use eddy_proto::CommandKind;
use eddy_server::node::Node;
use std::sync::Arc;
use tracing::debug;

/// Reference client for eddy storage nodes.
#[derive(Debug, Parser)]
#[command(name = "eddy-cli", version, about)]
struct Args {
    /// Remote node address in `<host>:<port>:<family>` form.
    #[arg(short = 'r', long = "remote")]
    remote: String,

    /// Object id as a hex string (up to 32 hex digits).
    #[arg(short = 'I', long = "id")]
    id: Option<String>,

    /// Replica group id.
    #[arg(short = 'g', long = "group", default_value_t = 0)]
    group: u32,

    /// Write the given file's contents to the object.
    #[arg(short = 'W', long = "write-file")]
    write_file: Option<String>,

    /// Read the object, writing payload to the given file (`-` for stdout).
    #[arg(short = 'R', long = "read-file")]
    read_file: Option<String>,

    /// Look the object up.
    #[arg(short = 'L', long = "lookup", default_value_t = false)]
    lookup: bool,

    /// Remove the object.
    #[arg(short = 'u', long = "unlink", default_value_t = false)]
    unlink: bool,

    /// Request node status.
    #[arg(short = 's', long = "status", default_value_t = false)]
    status: bool,

    /// Update the advertised node status to the given value.
    #[arg(short = 'U', long = "update-status")]
    update_status: Option<i32>,

    /// Request monitor statistics.
    #[arg(short = 'm', long = "monitor-stat", default_value_t = false)]
    monitor_stat: bool,

    /// Start defragmentation on the backend owning the key.
    #[arg(short = 'd', long = "defrag", default_value_t = false)]
    defrag: bool,

    /// Execute a remote command string.
    #[arg(short = 'c', long = "cmd")]
    exec_cmd: Option<String>,

    /// Per-operation wait timeout in seconds.
    #[arg(short = 'w', long = "wait-timeout", default_value_t = 5)]
    wait_timeout_secs: u64,
}

/// Outcome of one operation: final status plus concatenated reply payloads.
struct OpResult {
    status: i32,
    payload: Vec<u8>,
}

fn run_op(
    peer: &Arc<PeerState>,
    key: ObjectId,
    command: CommandKind,
    payload: Vec<u8>,
    wait_timeout: Duration,
) -> EddyResult<OpResult> {
    let (result_tx, result_rx) = mpsc::channel::<OpResult>();
    let mut collected: Vec<u8> = Vec::new();
    let callback = Box::new(move |header: &eddy_proto::FrameHeader, body: &[u8]| {
        if !body.is_empty() {
            collected.extend_from_slice(body);
        }
        if header.has_flag(flags::DESTROY) {
            let _ = result_tx.send(OpResult {
                status: header.status,
                payload: std::mem::take(&mut collected),
            });
        }
    });

    let trans = peer.send_request(key, command, 0, payload, callback)?;
    debug!(cmd = command.name(), trans, "sent request");
    result_rx
        .recv_timeout(wait_timeout + Duration::from_secs(1))
        .map_err(|_| EddyError::Timeout)
}

fn object_id(args: &Args) -> EddyResult<ObjectId> {
    match &args.id {
        Some(hex) => ObjectId::from_hex(hex, args.group)
            .ok_or_else(|| EddyError::Protocol(format!("bad object id {hex}"))),
        None => Ok(ObjectId::new([0; 16], args.group)),
    }
}

fn run() -> EddyResult<i32> {
    let args = Args::parse();
    let remote = parse_addr(&args.remote)?;
    let wait_timeout = Duration::from_secs(args.wait_timeout_secs);

    let config = NodeConfig {
        wait_timeout,
        io_thread_num: 1,
        nonblocking_io_thread_num: 1,
        net_thread_num: 1,
        ..NodeConfig::default()
    };
    let node = Node::new_client(config)?;
    let peer = node.connect(remote, JoinState::Connected)?;
    let key = object_id(&args)?;

    let mut first_failure = 0_i32;
    let mut note_status = |status: i32| {
        if status != 0 && first_failure == 0 {
            first_failure = status;
        }
    };

    if let Some(path) = &args.write_file {
        let body = fs::read(path)
            .map_err(|error| EddyError::Io(format!("read {path} failed: {error}")))?;
        let result = run_op(&peer, key, CommandKind::Write, body, wait_timeout)?;
        println!("write: status {}", result.status);
        note_status(result.status);
    }
    if let Some(path) = &args.read_file {
        let result = run_op(&peer, key, CommandKind::Read, Vec::new(), wait_timeout)?;
        if result.status == 0 {
            if path == "-" {
                println!("{}", String::from_utf8_lossy(&result.payload));
            } else {
                fs::write(path, &result.payload)
                    .map_err(|error| EddyError::Io(format!("write {path} failed: {error}")))?;
            }
        }
        println!("read: status {}", result.status);
        note_status(result.status);
    }
    if args.lookup {
        let result = run_op(&peer, key, CommandKind::Lookup, Vec::new(), wait_timeout)?;
        println!(
            "lookup: status {} payload {}",
            result.status,
            String::from_utf8_lossy(&result.payload)
        );
        note_status(result.status);
    }
    if args.unlink {
        let result = run_op(&peer, key, CommandKind::Remove, Vec::new(), wait_timeout)?;
        println!("remove: status {}", result.status);
        note_status(result.status);
    }
    if args.status || args.update_status.is_some() {
        let payload = args
            .update_status
            .map(|value| value.to_le_bytes().to_vec())
            .unwrap_or_default();
        let result = run_op(&peer, key, CommandKind::Status, payload, wait_timeout)?;
        print!("{}", String::from_utf8_lossy(&result.payload));
        println!("status: {}", result.status);
        note_status(result.status);
    }
    if args.monitor_stat {
        let result = run_op(&peer, key, CommandKind::MonitorStat, Vec::new(), wait_timeout)?;
        print!("{}", String::from_utf8_lossy(&result.payload));
        note_status(result.status);
    }
    if args.defrag {
        let result = run_op(&peer, key, CommandKind::DefragStart, Vec::new(), wait_timeout)?;
        println!("defrag: status {}", result.status);
        note_status(result.status);
    }
    if let Some(cmd) = &args.exec_cmd {
        let result = run_op(
            &peer,
            key,
            CommandKind::Exec,
            cmd.clone().into_bytes(),
            wait_timeout,
        )?;
        println!(
            "exec: status {} payload {}",
            result.status,
            String::from_utf8_lossy(&result.payload)
        );
        note_status(result.status);
    }

    Ok(first_failure)
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    match run() {
        Ok(0) => {}
        Ok(status) => std::process::exit(-status),
        Err(error) => {
            eprintln!("eddy-cli failed: {error}");
            std::process::exit(-error.errno());
        }
    }
}
