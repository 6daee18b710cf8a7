//! Runtime configuration consumed by node bootstrap code.

use std::time::Duration;

/// Length of the opaque authentication cookie carried in `Auth` frames.
pub const AUTH_COOKIE_SIZE: usize = 32;

/// Node behavior flags. Bit values are part of the join handshake payload and must not be
/// renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeFlags(pub u64);

impl NodeFlags {
    /// Node joins the network and becomes part of the storage.
    pub const JOIN_NETWORK: u64 = 1 << 0;
    /// Do not request the route table from remote nodes.
    pub const NO_ROUTE_LIST: u64 = 1 << 1;
    /// Mix states according to their weights before reading data.
    pub const MIX_STATES: u64 = 1 << 2;
    /// Globally disable checksum verification and update.
    pub const NO_CSUM: u64 = 1 << 3;
    /// Randomize states for read requests.
    pub const RANDOMIZE_STATES: u64 = 1 << 5;
    /// Keep ids in the cluster when a node leaves.
    pub const KEEPS_IDS_IN_CLUSTER: u64 = 1 << 6;

    #[must_use]
    pub fn contains(self, bit: u64) -> bool {
        (self.0 & bit) != 0
    }
}

/// Bootstrap configuration for one `eddy` node process.
///
/// Field names follow the configuration surface of the storage node: timeouts are wall-clock
/// seconds in the external config and are normalized into `Duration` here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    /// Address family for the listening socket: 2 (IPv4) or 10 (IPv6).
    pub family: i32,
    /// Listening port for server nodes.
    pub port: u16,
    /// How long a client waits for a transaction reply before giving up.
    pub wait_timeout: Duration,
    /// Interval of the stall sweep over per-connection timer indexes.
    pub check_timeout: Duration,
    /// Connection is reset after this many consecutive stalled sweeps.
    pub stall_count: u32,
    /// Worker threads in the blocking pool of the system place.
    pub io_thread_num: usize,
    /// Worker threads in the non-blocking pool of the system place.
    pub nonblocking_io_thread_num: usize,
    /// Number of network poller threads.
    pub net_thread_num: usize,
    /// I/O scheduling class for background worker threads (Linux ioprio).
    pub bg_ionice_class: i32,
    /// I/O scheduling priority for background worker threads (Linux ioprio).
    pub bg_ionice_prio: i32,
    /// `SO_PRIORITY` applied to accepted server-side sockets.
    pub server_prio: i32,
    /// `SO_PRIORITY` applied to client-initiated sockets.
    pub client_prio: i32,
    /// How many broken peers one reconnect pass attempts to revive.
    pub reconnect_batch_size: usize,
    /// Frames sent to one connection in a row before the poller moves on; 0 disables the cap.
    pub send_limit: u32,
    /// Behavior flags, see [`NodeFlags`].
    pub flags: NodeFlags,
    /// Opaque cookie compared constant-time during the auth handshake.
    pub auth_cookie: [u8; AUTH_COOKIE_SIZE],
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            family: 2,
            port: 1025,
            wait_timeout: Duration::from_secs(5),
            check_timeout: Duration::from_secs(60),
            stall_count: 3,
            io_thread_num: 4,
            nonblocking_io_thread_num: 4,
            net_thread_num: 1,
            bg_ionice_class: 0,
            bg_ionice_prio: 0,
            server_prio: 0,
            client_prio: 0,
            reconnect_batch_size: 25,
            send_limit: 0,
            flags: NodeFlags::default(),
            auth_cookie: [0; AUTH_COOKIE_SIZE],
        }
    }
}

impl NodeConfig {
    /// Clamps thread counts so a degenerate config still brings up a working node.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.io_thread_num = self.io_thread_num.max(1);
        self.nonblocking_io_thread_num = self.nonblocking_io_thread_num.max(1);
        self.net_thread_num = self.net_thread_num.max(1);
        self.reconnect_batch_size = self.reconnect_batch_size.max(1);
        self
    }

    /// Constant-time comparison of the handshake cookie against the configured one.
    ///
    /// The fold over all bytes runs regardless of where the first mismatch occurs, so the
    /// comparison time does not leak the matching prefix length.
    #[must_use]
    pub fn auth_cookie_matches(&self, presented: &[u8]) -> bool {
        if presented.len() != AUTH_COOKIE_SIZE {
            return false;
        }
        let mut acc = 0_u8;
        for (own, theirs) in self.auth_cookie.iter().zip(presented.iter()) {
            acc |= own ^ theirs;
        }
        acc == 0
    }
}

#[cfg(test)]
mod tests {
    use super::{NodeConfig, NodeFlags, AUTH_COOKIE_SIZE};
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn normalized_config_never_has_zero_threads() {
        let config = NodeConfig {
            io_thread_num: 0,
            nonblocking_io_thread_num: 0,
            net_thread_num: 0,
            ..NodeConfig::default()
        }
        .normalized();
        assert_that!(config.io_thread_num, eq(1));
        assert_that!(config.nonblocking_io_thread_num, eq(1));
        assert_that!(config.net_thread_num, eq(1));
    }

    #[rstest]
    fn auth_cookie_rejects_wrong_length_and_wrong_bytes() {
        let mut config = NodeConfig::default();
        config.auth_cookie = [7; AUTH_COOKIE_SIZE];
        assert_that!(config.auth_cookie_matches(&[7; AUTH_COOKIE_SIZE]), eq(true));
        assert_that!(config.auth_cookie_matches(&[7; 16]), eq(false));
        assert_that!(
            config.auth_cookie_matches(&[8; AUTH_COOKIE_SIZE]),
            eq(false)
        );
    }

    #[rstest]
    fn flags_test_individual_bits() {
        let flags = NodeFlags(NodeFlags::JOIN_NETWORK | NodeFlags::MIX_STATES);
        assert_that!(flags.contains(NodeFlags::JOIN_NETWORK), eq(true));
        assert_that!(flags.contains(NodeFlags::RANDOMIZE_STATES), eq(false));
    }
}
