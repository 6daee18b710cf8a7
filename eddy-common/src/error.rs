//! Shared error model for cross-crate APIs.

use thiserror::Error;

/// Unified result type used by all public interfaces in `eddy`.
pub type EddyResult<T> = Result<T, EddyError>;

/// High-level error categories surfaced by the network and I/O core.
///
/// Transient socket conditions (`EAGAIN`, `EINTR`) are retried locally and never reach this
/// enum. Everything that crosses a crate boundary does.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EddyError {
    /// Configuration is invalid for the requested operation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// Runtime state does not allow this operation.
    #[error("invalid runtime state: {0}")]
    InvalidState(&'static str),

    /// Wire payload is malformed or semantically invalid.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The peer link was torn down; the carried code is the negated errno recorded on the
    /// connection (`-ECONNRESET`, `-ETIMEDOUT`, ...).
    #[error("connection reset: {0}")]
    ConnectionReset(i32),

    /// A stalled transaction sweep or wait deadline expired.
    #[error("operation timed out")]
    Timeout,

    /// A bounded worker queue refused new work; callers surface this to the sender as a
    /// failure reply, not as a connection reset.
    #[error("worker pool queue is full")]
    Overload,

    /// Filesystem or socket I/O failed.
    #[error("io error: {0}")]
    Io(String),
}

impl EddyError {
    /// Negated-errno view used when stamping a status into a wire frame or exiting the CLI.
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            EddyError::InvalidConfig(_) | EddyError::InvalidState(_) => -libc_consts::EINVAL,
            EddyError::Protocol(_) => -libc_consts::EPROTO,
            EddyError::ConnectionReset(code) => *code,
            EddyError::Timeout => -libc_consts::ETIMEDOUT,
            EddyError::Overload => -libc_consts::EBUSY,
            EddyError::Io(_) => -libc_consts::EIO,
        }
    }
}

/// Errno values used in wire statuses. Kept as plain constants so `eddy-common` stays free of
/// platform crates; the numeric values follow the Linux ABI the wire format is defined against.
pub mod libc_consts {
    pub const EPERM: i32 = 1;
    pub const EIO: i32 = 5;
    pub const ENXIO: i32 = 6;
    pub const EBADF: i32 = 9;
    pub const EAGAIN: i32 = 11;
    pub const EBUSY: i32 = 16;
    pub const EINVAL: i32 = 22;
    pub const ENOSYS: i32 = 38;
    pub const EPROTO: i32 = 71;
    pub const ECONNRESET: i32 = 104;
    pub const ETIMEDOUT: i32 = 110;
}

#[cfg(test)]
mod tests {
    use super::{libc_consts, EddyError};
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn connection_reset_keeps_original_code() {
        let error = EddyError::ConnectionReset(-libc_consts::ECONNRESET);
        assert_that!(error.errno(), eq(-libc_consts::ECONNRESET));
    }

    #[rstest]
    fn timeout_maps_to_negated_etimedout() {
        assert_that!(EddyError::Timeout.errno(), eq(-libc_consts::ETIMEDOUT));
    }
}
