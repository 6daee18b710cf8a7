//! Fixed-header frame codec.
//!
//! Every frame starts with a 64-byte header followed by `size` payload bytes. All integer
//! fields are little-endian on the wire; the codec normalizes them on ingress and egress.
//! Payload bytes are opaque here.

use eddy_common::ids::{ObjectId, OBJECT_ID_SIZE};
use thiserror::Error;

use crate::command::CommandKind;

/// Wire size of the fixed header.
pub const HEADER_SIZE: usize = 64;

/// Protocol revision carried in the top byte of the command word.
pub const PROTOCOL_REVISION: u8 = 0x01;

/// Reserved flag bits; a frame with any of them set is malformed.
pub const FLAGS_RESERVED_MASK: u64 = 0xffff_0000_0000_0000;

/// Flag bit positions. These are part of the cross-implementation wire contract and must not
/// be renumbered.
pub mod flags {
    /// Request wants a terminal acknowledgement frame after processing.
    pub const NEED_ACK: u64 = 1 << 0;
    /// More reply frames follow for this transaction.
    pub const MORE: u64 = 1 << 1;
    /// Terminal callback marker; set on locally synthesized destroy frames.
    pub const DESTROY: u64 = 1 << 2;
    /// `backend_id` in the header is used verbatim instead of key routing.
    pub const DIRECT_BACKEND: u64 = 1 << 3;
    /// Command must not wait on backend locks; dispatched to the non-blocking pool.
    pub const NOLOCK: u64 = 1 << 4;
    /// Frame is a reply to an outstanding transaction.
    pub const REPLY: u64 = 1 << 6;
    /// Payload carries a checksum trailer.
    pub const CHECKSUM: u64 = 1 << 7;
    /// Propagate this frame's trace id into log events regardless of level.
    pub const TRACE: u64 = 1 << 8;
}

/// Codec failures. `Truncated` is an incremental-parse signal; the reserved-bit violations
/// mark the frame malformed (dropped and logged, connection stays up).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("truncated header: need {HEADER_SIZE} bytes, have {have}")]
    Truncated { have: usize },
    #[error("reserved flag bits set: {flags:#018x}")]
    BadMagic { flags: u64 },
    #[error("unsupported protocol revision {found:#04x}")]
    BadVersion { found: u8 },
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub id: ObjectId,
    pub command: CommandKind,
    pub flags: u64,
    pub trans: u64,
    pub trace_id: u64,
    pub backend_id: i32,
    pub size: u64,
    pub status: i32,
}

impl Default for FrameHeader {
    fn default() -> Self {
        Self {
            id: ObjectId::default(),
            command: CommandKind::Opaque(0),
            flags: 0,
            trans: 0,
            trace_id: 0,
            backend_id: -1,
            size: 0,
            status: 0,
        }
    }
}

impl FrameHeader {
    /// Parses a header from the front of `buf`.
    ///
    /// # Errors
    ///
    /// Returns `FrameError::Truncated` when fewer than [`HEADER_SIZE`] bytes are available,
    /// `FrameError::BadVersion` when the revision byte differs from [`PROTOCOL_REVISION`],
    /// and `FrameError::BadMagic` when reserved flag bits are set.
    pub fn parse(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < HEADER_SIZE {
            return Err(FrameError::Truncated { have: buf.len() });
        }

        let mut id = [0_u8; OBJECT_ID_SIZE];
        id.copy_from_slice(&buf[0..16]);
        let group_id = u32::from_le_bytes(buf[16..20].try_into().expect("slice width is fixed"));
        let command_word =
            u32::from_le_bytes(buf[20..24].try_into().expect("slice width is fixed"));
        let flags = u64::from_le_bytes(buf[24..32].try_into().expect("slice width is fixed"));
        let trans = u64::from_le_bytes(buf[32..40].try_into().expect("slice width is fixed"));
        let trace_id = u64::from_le_bytes(buf[40..48].try_into().expect("slice width is fixed"));
        let backend_id =
            i32::from_le_bytes(buf[48..52].try_into().expect("slice width is fixed"));
        let size = u64::from_le_bytes(buf[52..60].try_into().expect("slice width is fixed"));
        let status = i32::from_le_bytes(buf[60..64].try_into().expect("slice width is fixed"));

        let revision = (command_word >> 24) as u8;
        if revision != PROTOCOL_REVISION {
            return Err(FrameError::BadVersion { found: revision });
        }
        if (flags & FLAGS_RESERVED_MASK) != 0 {
            return Err(FrameError::BadMagic { flags });
        }

        Ok(Self {
            id: ObjectId::new(id, group_id),
            command: CommandKind::from_code(command_word & 0x00ff_ffff),
            flags,
            trans,
            trace_id,
            backend_id,
            size,
            status,
        })
    }

    /// Serializes the header into a fresh [`HEADER_SIZE`] buffer.
    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0_u8; HEADER_SIZE];
        buf[0..16].copy_from_slice(&self.id.id);
        buf[16..20].copy_from_slice(&self.id.group_id.to_le_bytes());
        let command_word =
            (u32::from(PROTOCOL_REVISION) << 24) | (self.command.code() & 0x00ff_ffff);
        buf[20..24].copy_from_slice(&command_word.to_le_bytes());
        buf[24..32].copy_from_slice(&self.flags.to_le_bytes());
        buf[32..40].copy_from_slice(&self.trans.to_le_bytes());
        buf[40..48].copy_from_slice(&self.trace_id.to_le_bytes());
        buf[48..52].copy_from_slice(&self.backend_id.to_le_bytes());
        buf[52..60].copy_from_slice(&self.size.to_le_bytes());
        buf[60..64].copy_from_slice(&self.status.to_le_bytes());
        buf
    }

    /// Reads only the payload-size field from raw header bytes.
    ///
    /// Used to stay in framing sync when the header is malformed: the receive machine skips
    /// this many payload bytes and keeps the connection up.
    #[must_use]
    pub fn peek_size(buf: &[u8; HEADER_SIZE]) -> u64 {
        u64::from_le_bytes(buf[52..60].try_into().expect("slice width is fixed"))
    }

    #[must_use]
    pub fn has_flag(&self, bit: u64) -> bool {
        (self.flags & bit) != 0
    }

    #[must_use]
    pub fn is_reply(&self) -> bool {
        self.has_flag(flags::REPLY)
    }

    /// Builds the locally synthesized terminal callback frame for a transaction.
    #[must_use]
    pub fn destroy_sentinel(trans: u64, status: i32) -> Self {
        Self {
            trans,
            flags: flags::REPLY | flags::DESTROY,
            status,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{flags, FrameError, FrameHeader, HEADER_SIZE};
    use crate::command::CommandKind;
    use eddy_common::ids::ObjectId;
    use googletest::prelude::*;
    use rstest::rstest;

    fn sample_header() -> FrameHeader {
        FrameHeader {
            id: ObjectId::new([0xab; 16], 3),
            command: CommandKind::Write,
            flags: flags::NEED_ACK | flags::NOLOCK,
            trans: 0x1122_3344_5566_7788,
            trace_id: 42,
            backend_id: 7,
            size: 4096,
            status: -5,
        }
    }

    #[rstest]
    fn encode_parse_roundtrip_preserves_all_fields() {
        let header = sample_header();
        let parsed = FrameHeader::parse(&header.encode()).expect("own encoding must parse");
        assert_that!(parsed, eq(header));
    }

    #[rstest]
    fn opaque_command_roundtrips() {
        let header = FrameHeader {
            command: CommandKind::Opaque(0x00ab_cdef),
            ..FrameHeader::default()
        };
        let parsed = FrameHeader::parse(&header.encode()).expect("own encoding must parse");
        assert_that!(parsed.command, eq(CommandKind::Opaque(0x00ab_cdef)));
    }

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(HEADER_SIZE - 1)]
    fn short_input_reports_truncation(#[case] len: usize) {
        let bytes = sample_header().encode();
        let result = FrameHeader::parse(&bytes[..len]);
        assert_that!(result, eq(&Err(FrameError::Truncated { have: len })));
    }

    #[rstest]
    fn reserved_flag_bits_are_rejected() {
        let mut bytes = sample_header().encode();
        // Highest flag byte lives at offset 31 in the little-endian u64 at 24..32.
        bytes[31] = 0x80;
        let result = FrameHeader::parse(&bytes);
        assert_that!(matches!(result, Err(FrameError::BadMagic { .. })), eq(true));
    }

    #[rstest]
    fn wrong_revision_is_rejected() {
        let mut bytes = sample_header().encode();
        bytes[23] = 0x02;
        let result = FrameHeader::parse(&bytes);
        assert_that!(
            result,
            eq(&Err(FrameError::BadVersion { found: 0x02 }))
        );
    }

    #[rstest]
    fn destroy_sentinel_carries_status_and_terminal_flags() {
        let sentinel = FrameHeader::destroy_sentinel(9, -110);
        assert_that!(sentinel.trans, eq(9));
        assert_that!(sentinel.status, eq(-110));
        assert_that!(sentinel.has_flag(flags::DESTROY), eq(true));
        assert_that!(sentinel.is_reply(), eq(true));
        assert_that!(sentinel.size, eq(0));
    }
}
