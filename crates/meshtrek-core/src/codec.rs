//! Compact identifier encodings shared with the kernel-side probes
//!
//! HTTP/2 connection fragments carry the plain stream ids they multiplexed as
//! 16-bit slots packed into two integers:
//!
//! - `Stream IDs` holds up to 4 ids, first id in bits 48..64, then 32..48,
//!   16..32 and 0..16.
//! - `Extra Stream IDs` holds up to 2 overflow ids, first in bits 16..32,
//!   second in bits 0..16.
//!
//! A zero slot is empty, so a zero id can never be encoded. Request and
//! response fragments of HTTP/2 streams carry a composite `Key` of
//! `connection_id << 32 | plain_stream_id`.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Slots in the inline 64-bit field
pub const INLINE_SLOTS: usize = 4;

/// Slots in the overflow field
pub const OVERFLOW_SLOTS: usize = 2;

/// Maximum number of plain stream ids one connection fragment can carry
pub const MAX_STREAM_IDS: usize = INLINE_SLOTS + OVERFLOW_SLOTS;

/// Codec errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("cannot pack {0} stream ids, at most {MAX_STREAM_IDS} fit")]
    TooManyStreamIds(usize),

    #[error("stream id 0 marks an empty slot and cannot be packed")]
    ZeroStreamId,
}

pub type CodecResult<T> = Result<T, CodecError>;

/// Wire protocol of a fragment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http1,
    Http2,
}

impl Protocol {
    /// A fragment is HTTP/2-shaped iff it carries the composite key.
    pub fn classify(composite_key: Option<u64>) -> Self {
        if composite_key.is_some() {
            Protocol::Http2
        } else {
            Protocol::Http1
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Http1 => write!(f, "http/1"),
            Protocol::Http2 => write!(f, "http/2"),
        }
    }
}

/// Split a composite key into `(connection_id, plain_stream_id)`.
pub fn split_key(key: u64) -> (u32, u32) {
    ((key >> 32) as u32, (key & 0xffff_ffff) as u32)
}

/// Inverse of [`split_key`].
pub fn join_key(connection_id: u32, plain_stream_id: u32) -> u64 {
    ((connection_id as u64) << 32) | plain_stream_id as u64
}

/// Plain stream ids packed into the inline and overflow fields
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PackedStreamIds {
    pub inline: u64,
    pub overflow: u64,
}

impl PackedStreamIds {
    pub fn new(inline: u64, overflow: u64) -> Self {
        Self { inline, overflow }
    }

    /// Ordered non-zero ids: inline slots first, then overflow.
    pub fn unpack(&self) -> Vec<u16> {
        let inline = (0..INLINE_SLOTS)
            .rev()
            .map(|slot| ((self.inline >> (slot * 16)) & 0xffff) as u16);
        let overflow = (0..OVERFLOW_SLOTS)
            .rev()
            .map(|slot| ((self.overflow >> (slot * 16)) & 0xffff) as u16);
        inline.chain(overflow).filter(|id| *id != 0).collect()
    }

    /// Membership test against a plain stream id taken from a composite key.
    pub fn contains(&self, plain_stream_id: u32) -> bool {
        u16::try_from(plain_stream_id)
            .map(|id| id != 0 && self.unpack().contains(&id))
            .unwrap_or(false)
    }

    pub fn is_empty(&self) -> bool {
        self.unpack().is_empty()
    }
}

/// Pack up to [`MAX_STREAM_IDS`] non-zero ids.
pub fn pack_stream_ids(ids: &[u16]) -> CodecResult<PackedStreamIds> {
    if ids.len() > MAX_STREAM_IDS {
        return Err(CodecError::TooManyStreamIds(ids.len()));
    }
    if ids.contains(&0) {
        return Err(CodecError::ZeroStreamId);
    }

    let mut packed = PackedStreamIds::default();
    for (i, id) in ids.iter().enumerate() {
        if i < INLINE_SLOTS {
            packed.inline |= (*id as u64) << ((INLINE_SLOTS - 1 - i) * 16);
        } else {
            let slot = i - INLINE_SLOTS;
            packed.overflow |= (*id as u64) << ((OVERFLOW_SLOTS - 1 - slot) * 16);
        }
    }
    Ok(packed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_round_trip_all_sizes() {
        let ids = [7u16, 300, 65535, 12, 9, 41];
        for n in 0..=MAX_STREAM_IDS {
            let packed = pack_stream_ids(&ids[..n]).unwrap();
            assert_eq!(packed.unpack(), ids[..n].to_vec());
        }
    }

    #[test]
    fn test_inline_layout_matches_probe_encoding() {
        let packed = pack_stream_ids(&[1, 3, 5]).unwrap();
        assert_eq!(packed.inline, (1u64 << 48) | (3u64 << 32) | (5u64 << 16));
        assert_eq!(packed.overflow, 0);

        let packed = pack_stream_ids(&[1, 2, 3, 4, 5, 6]).unwrap();
        assert_eq!(packed.overflow, (5u64 << 16) | 6);
    }

    #[test]
    fn test_pack_rejects_overflow_and_zero() {
        assert_eq!(
            pack_stream_ids(&[1, 2, 3, 4, 5, 6, 7]),
            Err(CodecError::TooManyStreamIds(7))
        );
        assert_eq!(pack_stream_ids(&[1, 0]), Err(CodecError::ZeroStreamId));
    }

    #[test]
    fn test_contains_is_membership_not_equality() {
        let packed = pack_stream_ids(&[1, 3, 5, 7, 9]).unwrap();
        assert!(packed.contains(3));
        assert!(packed.contains(9));
        assert!(!packed.contains(4));
        assert!(!packed.contains(0));
        assert!(!packed.contains(70_000));
    }

    #[test]
    fn test_key_split() {
        let key = join_key(42, 7);
        assert_eq!(key, (42u64 << 32) | 7);
        assert_eq!(split_key(key), (42, 7));
    }

    #[test]
    fn test_classify() {
        assert_eq!(Protocol::classify(Some(0)), Protocol::Http2);
        assert_eq!(Protocol::classify(None), Protocol::Http1);
    }
}
