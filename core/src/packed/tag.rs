//! Segment type tags.
//!
//! A tag is a type code of up to 61 bits. It is stored as the value `(code << 3) | (len - 1)`
//! in `len` bytes (1..=8) that end exactly at the payload start. The least significant byte
//! sits immediately before the payload and the following bytes run toward lower addresses,
//! so a reader positioned at a payload recovers the length from the low bits of the byte at
//! `start - 1` and then reads the remaining bytes backward.

use std::fmt;

/// Largest type code a tag can carry.
pub const MAX_TAG_CODE: u64 = (1 << 61) - 1;

/// The type code of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentTag(u64);

impl SegmentTag {
    /// The tag of a slot that holds no structure.
    pub const EMPTY: SegmentTag = SegmentTag(0);
    /// [`crate::packed::PackedSumTree`].
    pub const SUM_TREE: SegmentTag = SegmentTag(0x11);
    /// [`crate::packed::PackedSeq`].
    pub const SEQ: SegmentTag = SegmentTag(0x12);
    /// [`crate::packed::PackedArray`].
    pub const ARRAY: SegmentTag = SegmentTag(0x2013);

    /// Create a tag from a type code.
    ///
    /// Panics if the code does not fit in 61 bits.
    pub const fn new(code: u64) -> Self {
        assert!(code <= MAX_TAG_CODE);
        SegmentTag(code)
    }

    pub fn code(&self) -> u64 {
        self.0
    }

    /// Number of bytes the encoded tag occupies.
    pub fn encoded_len(&self) -> usize {
        let with_len = (self.0 << 3) | 0b111;
        let bits = 64 - with_len.leading_zeros() as usize;
        (bits + 7) / 8
    }

    fn encoded(&self) -> u64 {
        (self.0 << 3) | (self.encoded_len() as u64 - 1)
    }

    /// Write the tag so that it ends at `payload_start`.
    ///
    /// Panics if fewer than [`Self::encoded_len`] bytes precede `payload_start`.
    pub fn write_before(&self, buf: &mut [u8], payload_start: usize) {
        let len = self.encoded_len();
        assert!(payload_start >= len);
        let bytes = self.encoded().to_le_bytes();
        for (i, byte) in bytes[..len].iter().enumerate() {
            buf[payload_start - 1 - i] = *byte;
        }
    }

    /// Read the tag that ends at `payload_start`.
    ///
    /// Returns `None` if the length bits point before the start of the buffer or if the
    /// encoding is not the shortest one.
    pub fn read_before(buf: &[u8], payload_start: usize) -> Option<SegmentTag> {
        if payload_start == 0 || payload_start > buf.len() {
            return None;
        }
        let first = buf[payload_start - 1];
        let len = (first & 0b111) as usize + 1;
        if payload_start < len {
            return None;
        }

        let mut value = 0u64;
        for i in 0..len {
            value |= (buf[payload_start - 1 - i] as u64) << (8 * i);
        }

        let tag = SegmentTag(value >> 3);
        if tag.encoded_len() != len {
            return None;
        }
        Some(tag)
    }
}

impl fmt::Display for SegmentTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lengths() {
        assert_eq!(SegmentTag::EMPTY.encoded_len(), 1);
        assert_eq!(SegmentTag::SUM_TREE.encoded_len(), 1);
        assert_eq!(SegmentTag::ARRAY.encoded_len(), 2);
        assert_eq!(SegmentTag::new(MAX_TAG_CODE).encoded_len(), 8);
    }

    #[test]
    fn read_backward_from_payload() {
        let mut buf = [0xAAu8; 16];
        let tag = SegmentTag::new(0x1234_5678);
        tag.write_before(&mut buf, 12);

        // bytes before the tag stay untouched
        let len = tag.encoded_len();
        assert_eq!(buf[12 - len - 1], 0xAA);
        assert_eq!(buf[12], 0xAA);

        // least significant byte is adjacent to the payload
        assert_eq!(buf[11] & 0b111, len as u8 - 1);
        assert_eq!(SegmentTag::read_before(&buf, 12), Some(tag));
    }

    #[test]
    fn every_length_is_recoverable() {
        let mut buf = [0u8; 16];
        for shift in 0..61 {
            let tag = SegmentTag::new(1 << shift);
            tag.write_before(&mut buf, 8);
            assert_eq!(SegmentTag::read_before(&buf, 8), Some(tag), "shift {shift}");
        }
    }

    #[test]
    fn truncated_tag_is_rejected() {
        let mut buf = [0u8; 4];
        // claims 8 bytes but only 2 precede the payload.
        buf[1] = 0b111;
        assert_eq!(SegmentTag::read_before(&buf, 2), None);
        assert_eq!(SegmentTag::read_before(&buf, 0), None);
    }
}
