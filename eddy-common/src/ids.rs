//! Canonical identifier types shared by the codec, routing, and logging.

use std::fmt;

/// Width of an object key on the wire.
pub const OBJECT_ID_SIZE: usize = 16;

/// How many leading bytes a short dump renders; full keys are noisy in logs.
const SHORT_DUMP_BYTES: usize = 6;

/// Backend identifier. `-1` addresses the backend-less "system" place.
pub type BackendId = i32;

/// Backend id of the system place used for commands that do not need a backend.
pub const SYSTEM_BACKEND_ID: BackendId = -1;

/// Object key identifying data on the ring, paired with the replica group it lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ObjectId {
    pub id: [u8; OBJECT_ID_SIZE],
    pub group_id: u32,
}

impl ObjectId {
    #[must_use]
    pub fn new(id: [u8; OBJECT_ID_SIZE], group_id: u32) -> Self {
        Self { id, group_id }
    }

    /// Parses a full-width hex string into a key, tolerating a shorter prefix padded with
    /// zeroes the way operator tooling writes partial ids.
    ///
    /// # Errors
    ///
    /// Returns `None` for non-hex characters or input longer than the key width.
    #[must_use]
    pub fn from_hex(hex: &str, group_id: u32) -> Option<Self> {
        if hex.len() > OBJECT_ID_SIZE * 2 {
            return None;
        }
        let mut id = [0_u8; OBJECT_ID_SIZE];
        let mut nibbles = [0_u8; OBJECT_ID_SIZE * 2];
        for (slot, ch) in nibbles.iter_mut().zip(hex.chars()) {
            *slot = match ch.to_digit(16) {
                Some(digit) => digit as u8,
                None => return None,
            };
        }
        for (index, pair) in nibbles.chunks_exact(2).enumerate() {
            id[index] = (pair[0] << 4) | pair[1];
        }
        Some(Self { id, group_id })
    }

    /// Short hex dump used in log lines.
    #[must_use]
    pub fn dump(&self) -> String {
        let mut out = String::with_capacity(SHORT_DUMP_BYTES * 2 + 4);
        for byte in &self.id[..SHORT_DUMP_BYTES] {
            out.push_str(&format!("{byte:02x}"));
        }
        out.push_str("...");
        out
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.id {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "/{}", self.group_id)
    }
}

#[cfg(test)]
mod tests {
    use super::{ObjectId, OBJECT_ID_SIZE};
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn hex_parses_full_width_key() {
        let hex = "0a".repeat(OBJECT_ID_SIZE);
        let key = ObjectId::from_hex(&hex, 2).expect("full-width hex must parse");
        assert_that!(key.id, eq([0x0a; OBJECT_ID_SIZE]));
        assert_that!(key.group_id, eq(2));
    }

    #[rstest]
    fn hex_pads_short_prefix_with_zeroes() {
        let key = ObjectId::from_hex("ff01", 0).expect("short hex must parse");
        assert_that!(key.id[0], eq(0xff));
        assert_that!(key.id[1], eq(0x01));
        assert_that!(key.id[2], eq(0));
    }

    #[rstest]
    #[case("zz")]
    #[case("0a0b0c0d0e0f0a0b0c0d0e0f0a0b0c0d0eff")]
    fn hex_rejects_garbage_and_overflow(#[case] input: &str) {
        assert_that!(ObjectId::from_hex(input, 0), eq(None));
    }

    #[rstest]
    fn display_renders_key_and_group() {
        let key = ObjectId::new([0x12; OBJECT_ID_SIZE], 7);
        let rendered = key.to_string();
        assert_that!(rendered.ends_with("/7"), eq(true));
        assert_that!(rendered.starts_with("1212"), eq(true));
    }
}
