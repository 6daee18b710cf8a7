//! Wire protocol model: the fixed 64-byte frame header, command kinds, and flag bits.
//!
//! Payload bytes are opaque at this layer; the codec only reconstructs and serializes the
//! header and validates its reserved-bit contract.

pub mod command;
pub mod frame;

pub use command::CommandKind;
pub use frame::{FrameError, FrameHeader, HEADER_SIZE};
