//! Binary entrypoint for `eddy-server`.

use std::sync::Arc;

use clap::Parser;
use eddy_common::addr::parse_addr;
use eddy_common::config::{NodeConfig, NodeFlags};
use eddy_common::error::{EddyError, EddyResult};
use eddy_net::dispatch::EmptyRouteTable;
use eddy_server::node::Node;
use std::time::Duration;

/// Storage node daemon: listens for peers and serves framed storage commands.
#[derive(Debug, Parser)]
#[command(name = "eddy-server", version, about)]
struct Args {
    /// Listen address in `<host>:<port>:<family>` form.
    #[arg(short = 'a', long = "addr", default_value = "127.0.0.1:1025:2")]
    addr: String,

    /// Worker threads in the blocking system pool.
    #[arg(short = 'i', long = "io-threads", default_value_t = 4)]
    io_threads: usize,

    /// Worker threads in the non-blocking system pool.
    #[arg(short = 'n', long = "nonblocking-io-threads", default_value_t = 4)]
    nonblocking_io_threads: usize,

    /// Network poller threads.
    #[arg(short = 't', long = "net-threads", default_value_t = 1)]
    net_threads: usize,

    /// Join the storage network.
    #[arg(short = 'j', long = "join", default_value_t = false)]
    join: bool,

    /// Stall sweep interval in seconds.
    #[arg(long = "check-timeout", default_value_t = 60)]
    check_timeout_secs: u64,

    /// Stalled sweeps tolerated before a peer is reset.
    #[arg(long = "stall-count", default_value_t = 3)]
    stall_count: u32,
}

fn run() -> EddyResult<()> {
    let args = Args::parse();
    let listen_addr = parse_addr(&args.addr)?;

    let mut flags = NodeFlags::default();
    if args.join {
        flags.0 |= NodeFlags::JOIN_NETWORK;
    }
    let config = NodeConfig {
        port: listen_addr.port(),
        io_thread_num: args.io_threads,
        nonblocking_io_thread_num: args.nonblocking_io_threads,
        net_thread_num: args.net_threads,
        check_timeout: Duration::from_secs(args.check_timeout_secs),
        stall_count: args.stall_count,
        flags,
        ..NodeConfig::default()
    };

    let node = Node::new_server(config, listen_addr, Arc::new(EmptyRouteTable))?;
    node.wait();
    let code = node.need_exit();
    if code != 0 && code != 1 {
        return Err(EddyError::Io(format!("node stopped with code {code}")));
    }
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if let Err(err) = run() {
        eprintln!("failed to run eddy-server: {err}");
        std::process::exit(1);
    }
}
