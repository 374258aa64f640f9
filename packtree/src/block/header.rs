//! The block header.
//!
//! Here is the fixed layout of the header, as it precedes the payload in a block image:
//!
//! ```rust,ignore
//! version: u32
//! block_size: u32            // header + payload
//! cache_group: u8
//! cache_priority: u8
//! _reserved: [u8; 6]
//! ctr_type_hash: u64
//! block_type_hash: u64
//! next_block_pos: u64
//! target_block_pos: u64
//! references: i64
//! log_sequence_number: u64
//! uid: u64
//! id: u64
//! snapshot_id: u64
//! ```
//!
//! Independently of the image, the header has a stream encoding used when blocks are shipped
//! between stores. It carries the persistent subset of the fields in a fixed order.

use std::sync::atomic::{AtomicI64, Ordering};

use super::{BlockId, BlockUid, SnapshotId};
use crate::error::{Error, Result};

/// Size of the fixed header layout.
pub const HEADER_SIZE: usize = 88;

/// Size of the stream encoding of a header.
pub const STREAM_SIZE: usize = 62;

/// The header layout version written by this crate.
pub const VERSION: u32 = 1;

/// The cache group a block belongs to. Page caches keep groups apart, evicting payload blocks
/// before tree nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CacheGroup {
    Root = 0,
    Branch = 1,
    Leaf = 2,
    Payload = 3,
}

impl CacheGroup {
    /// Default eviction priority of the group. Higher values stay cached longer.
    pub fn priority(self) -> u8 {
        match self {
            CacheGroup::Root => 3,
            CacheGroup::Branch => 2,
            CacheGroup::Leaf => 1,
            CacheGroup::Payload => 0,
        }
    }
}

impl TryFrom<u8> for CacheGroup {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0 => CacheGroup::Root,
            1 => CacheGroup::Branch,
            2 => CacheGroup::Leaf,
            3 => CacheGroup::Payload,
            other => return Err(Error::structural(format!("unknown cache group {other}"))),
        })
    }
}

/// The header of a block.
///
/// The reference count is atomic: a block shared by several snapshots may be read through
/// one of them while another releases its reference.
#[derive(Debug)]
pub struct BlockHeader {
    pub version: u32,
    pub block_size: u32,
    pub cache_group: CacheGroup,
    pub cache_priority: u8,
    /// Hash of the container type the block belongs to.
    pub ctr_type_hash: u64,
    /// Hash of the payload type.
    pub block_type_hash: u64,
    /// Position of the next block in the persistent store. Unused by the in-memory store.
    pub next_block_pos: u64,
    /// Position the block is to be written to. Unused by the in-memory store.
    pub target_block_pos: u64,
    references: AtomicI64,
    pub log_sequence_number: u64,
    pub uid: BlockUid,
    pub id: BlockId,
    pub snapshot_id: SnapshotId,
}

impl Clone for BlockHeader {
    fn clone(&self) -> Self {
        BlockHeader {
            references: AtomicI64::new(self.references()),
            ..*self
        }
    }
}

impl PartialEq for BlockHeader {
    fn eq(&self, other: &Self) -> bool {
        let mut a = [0; HEADER_SIZE];
        let mut b = [0; HEADER_SIZE];
        self.encode_to(&mut a);
        other.encode_to(&mut b);
        a == b
    }
}

impl Eq for BlockHeader {}

impl BlockHeader {
    /// A fresh header with no references.
    pub fn new(
        id: BlockId,
        uid: BlockUid,
        snapshot_id: SnapshotId,
        block_size: u32,
        cache_group: CacheGroup,
    ) -> Self {
        BlockHeader {
            version: VERSION,
            block_size,
            cache_group,
            cache_priority: cache_group.priority(),
            ctr_type_hash: 0,
            block_type_hash: 0,
            next_block_pos: 0,
            target_block_pos: 0,
            references: AtomicI64::new(0),
            log_sequence_number: 0,
            uid,
            id,
            snapshot_id,
        }
    }

    pub fn references(&self) -> i64 {
        self.references.load(Ordering::Acquire)
    }

    /// Add a reference. Returns the new count.
    pub fn add_reference(&self) -> i64 {
        self.references.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drop a reference. Returns `true` when this was the last one.
    ///
    /// Panics if the count was not positive: that means a reference was dropped twice and the
    /// store can no longer be trusted.
    pub fn release_reference(&self) -> bool {
        let prev = self.references.fetch_sub(1, Ordering::AcqRel);
        if prev < 1 {
            panic!(
                "block {} reference count dropped below zero (was {prev})",
                self.id
            );
        }
        prev == 1
    }

    pub(crate) fn reset_references(&mut self) {
        *self.references.get_mut() = 0;
    }

    /// Write the fixed layout.
    pub fn encode_to(&self, buf: &mut [u8]) {
        assert_eq!(buf.len(), HEADER_SIZE);
        buf[0..4].copy_from_slice(&self.version.to_le_bytes());
        buf[4..8].copy_from_slice(&self.block_size.to_le_bytes());
        buf[8] = self.cache_group as u8;
        buf[9] = self.cache_priority;
        buf[10..16].fill(0);
        buf[16..24].copy_from_slice(&self.ctr_type_hash.to_le_bytes());
        buf[24..32].copy_from_slice(&self.block_type_hash.to_le_bytes());
        buf[32..40].copy_from_slice(&self.next_block_pos.to_le_bytes());
        buf[40..48].copy_from_slice(&self.target_block_pos.to_le_bytes());
        buf[48..56].copy_from_slice(&self.references().to_le_bytes());
        buf[56..64].copy_from_slice(&self.log_sequence_number.to_le_bytes());
        buf[64..72].copy_from_slice(&self.uid.0.to_le_bytes());
        buf[72..80].copy_from_slice(&self.id.0.to_le_bytes());
        buf[80..88].copy_from_slice(&self.snapshot_id.0.to_le_bytes());
    }

    /// Read the fixed layout.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::structural("block header truncated"));
        }
        // UNWRAP: all slices have the exact width of the integer they are converted to.
        let u32_at = |at: usize| u32::from_le_bytes(buf[at..at + 4].try_into().unwrap());
        let u64_at = |at: usize| u64::from_le_bytes(buf[at..at + 8].try_into().unwrap());

        let version = u32_at(0);
        if version != VERSION {
            return Err(Error::structural(format!(
                "unsupported block header version {version}"
            )));
        }
        Ok(BlockHeader {
            version,
            block_size: u32_at(4),
            cache_group: CacheGroup::try_from(buf[8])?,
            cache_priority: buf[9],
            ctr_type_hash: u64_at(16),
            block_type_hash: u64_at(24),
            next_block_pos: u64_at(32),
            target_block_pos: u64_at(40),
            references: AtomicI64::new(u64_at(48) as i64),
            log_sequence_number: u64_at(56),
            uid: BlockUid(u64_at(64)),
            id: BlockId(u64_at(72)),
            snapshot_id: SnapshotId(u64_at(80)),
        })
    }

    /// Append the stream encoding.
    pub fn serialize(&self, out: &mut Vec<u8>) {
        out.push(self.cache_group as u8);
        out.push(self.cache_priority);
        out.extend_from_slice(&self.block_size.to_le_bytes());
        out.extend_from_slice(&self.ctr_type_hash.to_le_bytes());
        out.extend_from_slice(&self.block_type_hash.to_le_bytes());
        out.extend_from_slice(&self.next_block_pos.to_le_bytes());
        out.extend_from_slice(&self.target_block_pos.to_le_bytes());
        out.extend_from_slice(&self.uid.0.to_le_bytes());
        out.extend_from_slice(&self.snapshot_id.0.to_le_bytes());
        out.extend_from_slice(&self.references().to_le_bytes());
    }

    /// Read a stream encoding from the front of `input`, advancing it.
    ///
    /// Fields outside the stream encoding take their defaults. In particular the block has no
    /// ID until a store adopts it.
    pub fn deserialize(input: &mut &[u8]) -> Result<Self> {
        if input.len() < STREAM_SIZE {
            return Err(Error::structural("block header stream truncated"));
        }
        let (buf, rest) = input.split_at(STREAM_SIZE);
        *input = rest;

        // UNWRAP: all slices have the exact width of the integer they are converted to.
        let u64_at = |at: usize| u64::from_le_bytes(buf[at..at + 8].try_into().unwrap());
        Ok(BlockHeader {
            version: VERSION,
            cache_group: CacheGroup::try_from(buf[0])?,
            cache_priority: buf[1],
            block_size: u32::from_le_bytes(buf[2..6].try_into().unwrap()),
            ctr_type_hash: u64_at(6),
            block_type_hash: u64_at(14),
            next_block_pos: u64_at(22),
            target_block_pos: u64_at(30),
            uid: BlockUid(u64_at(38)),
            snapshot_id: SnapshotId(u64_at(46)),
            references: AtomicI64::new(u64_at(54) as i64),
            log_sequence_number: 0,
            id: BlockId::INVALID,
        })
    }
}
