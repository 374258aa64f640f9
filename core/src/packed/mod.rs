//! Packed structures and the allocator they live in.
//!
//! All multi-byte integers are little-endian. Every structure is addressed through a small
//! `Copy` handle naming its allocator slot; reads go through a borrowed view and writes take
//! the allocator mutably. Writes either complete or fail with [`OutOfBlockSpace`] before
//! touching the segment contents.

pub mod allocator;
pub mod array;
pub mod index;
pub mod opt_array;
pub mod seq;
pub mod tag;
pub mod tree;

pub use allocator::{PackedAllocator, SegmentHeader};
pub use array::{ArrayView, PackedArray};
pub use index::SearchType;
pub use opt_array::{OptArrayView, PackedOptArray};
pub use seq::{PackedSeq, SeqView};
pub use tag::SegmentTag;
pub use tree::{FindResult, PackedSumTree, SumTreeView};

/// Alignment of every segment payload, in bytes.
pub const ALIGNMENT: usize = 8;

/// A segment could not grow because the buffer has no free space left.
///
/// This is not an error condition for the tree: the caller splits the node and retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("out of block space: {requested} bytes requested, {available} available")]
pub struct OutOfBlockSpace {
    /// Additional bytes the operation needed.
    pub requested: usize,
    /// Free bytes remaining in the buffer.
    pub available: usize,
}

/// Corruption or misuse detected while reading packed data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PackedError {
    /// The tag stored before a segment payload does not decode.
    #[error("corrupted tag before segment {slot}")]
    CorruptedTag {
        /// Segment slot.
        slot: usize,
    },

    /// The tag stored in the segment header disagrees with the bytes before the payload.
    #[error("segment {slot}: header tag {header} does not match stored tag {stored}")]
    TagConflict {
        /// Segment slot.
        slot: usize,
        /// Tag code in the structured segment header.
        header: u64,
        /// Tag code decoded from the payload prefix.
        stored: u64,
    },

    /// A typed view was requested over a segment holding another structure.
    #[error("segment {slot}: expected tag {expected}, found {found}")]
    TagMismatch {
        /// Segment slot.
        slot: usize,
        /// Tag of the requested view.
        expected: u64,
        /// Tag found in the segment.
        found: u64,
    },

    /// The allocator header does not describe a valid layout.
    #[error("invalid allocator layout: {0}")]
    InvalidLayout(&'static str),

    /// A structure's index disagrees with its values.
    #[error("segment {slot}: index drift at level {level}, entry {entry}")]
    IndexDrift {
        /// Segment slot, if known.
        slot: usize,
        /// Index level, counted from the bottom.
        level: usize,
        /// Entry within the level.
        entry: usize,
    },
}

/// A typed, read-only view over the payload of one segment.
pub trait PackedView<'a>: Sized {
    /// The tag every segment of this type carries.
    const TAG: SegmentTag;

    /// Interpret a segment payload. The tag has already been checked.
    fn from_segment(bytes: &'a [u8]) -> Self;
}

pub(crate) fn read_u32(buf: &[u8], offset: usize) -> u32 {
    // UNWRAP: the slice has exactly 4 bytes.
    u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap())
}

pub(crate) fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn read_u64(buf: &[u8], offset: usize) -> u64 {
    // UNWRAP: the slice has exactly 8 bytes.
    u64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap())
}

pub(crate) fn write_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn round_up(len: usize) -> usize {
    (len + ALIGNMENT - 1) & !(ALIGNMENT - 1)
}
