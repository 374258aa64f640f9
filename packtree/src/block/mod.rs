//! Blocks: the copy-on-write storage unit.
//!
//! A block is a header plus a fixed-size payload. Tree nodes keep a node header and a packed
//! allocator in the payload; blob blocks keep raw bytes.

use std::fmt;

use crate::error::{Error, Result};

pub mod header;

pub use header::{BlockHeader, CacheGroup, HEADER_SIZE};

/// Identifies a live block within a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub(crate) u64);

impl BlockId {
    /// The ID of a block that has not been adopted by a store.
    pub const INVALID: BlockId = BlockId(u64::MAX);

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub(crate) fn from_key(key: usize) -> Self {
        BlockId(key as u64)
    }

    pub(crate) fn key(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Unique block identity. Unlike [`BlockId`], never reused within a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockUid(pub(crate) u64);

impl BlockUid {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Identifies a snapshot, the mutation epoch owning a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SnapshotId(pub(crate) u64);

impl SnapshotId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Identifies a container within a snapshot. Chosen by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContainerId(pub u64);

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

const TYPE_HASH_SEED: u64 = 0x7061_636b_7472_6565;

/// Hash of a type name, as stored in the type hash fields of a block header.
pub fn type_hash(name: &str) -> u64 {
    twox_hash::XxHash64::oneshot(TYPE_HASH_SEED, name.as_bytes())
}

/// A block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    header: BlockHeader,
    payload: Vec<u8>,
}

impl Block {
    /// Create a block with a zeroed payload filling the rest of `header.block_size`.
    pub(crate) fn new(header: BlockHeader) -> Result<Self> {
        let payload_size = (header.block_size as usize)
            .checked_sub(HEADER_SIZE)
            .ok_or_else(|| {
                Error::structural(format!(
                    "block size {} is smaller than the header",
                    header.block_size
                ))
            })?;
        Ok(Block {
            header,
            payload: vec![0; payload_size],
        })
    }

    pub fn header(&self) -> &BlockHeader {
        &self.header
    }

    pub(crate) fn header_mut(&mut self) -> &mut BlockHeader {
        &mut self.header
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub(crate) fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.payload
    }

    pub fn id(&self) -> BlockId {
        self.header.id
    }

    pub fn snapshot_id(&self) -> SnapshotId {
        self.header.snapshot_id
    }

    pub fn references(&self) -> i64 {
        self.header.references()
    }

    /// The block image: the fixed header layout followed by the payload.
    pub fn to_image(&self) -> Vec<u8> {
        let mut image = vec![0; HEADER_SIZE + self.payload.len()];
        self.header.encode_to(&mut image[..HEADER_SIZE]);
        image[HEADER_SIZE..].copy_from_slice(&self.payload);
        image
    }

    /// Read a block image.
    pub fn from_image(image: &[u8]) -> Result<Self> {
        let header = BlockHeader::decode(image)?;
        if header.block_size as usize != image.len() {
            return Err(Error::structural(format!(
                "block image of {} bytes, header says {}",
                image.len(),
                header.block_size
            )));
        }
        Ok(Block {
            header,
            payload: image[HEADER_SIZE..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_round_trip() {
        let header =
            BlockHeader::new(BlockId(4), BlockUid(40), SnapshotId(2), 256, CacheGroup::Leaf);
        let mut block = Block::new(header).unwrap();
        block.payload_mut()[..3].copy_from_slice(&[1, 2, 3]);
        block.header().add_reference();

        let image = block.to_image();
        assert_eq!(image.len(), 256);
        let decoded = Block::from_image(&image).unwrap();
        assert_eq!(decoded, block);
        assert_eq!(decoded.references(), 1);

        assert!(Block::from_image(&image[..200]).is_err());
    }

    #[test]
    fn blocks_smaller_than_the_header_are_rejected() {
        let header = BlockHeader::new(
            BlockId(1),
            BlockUid(1),
            SnapshotId(1),
            HEADER_SIZE as u32 - 1,
            CacheGroup::Leaf,
        );
        assert!(matches!(Block::new(header), Err(Error::Structural(_))));

        let size = HEADER_SIZE as u32;
        let header =
            BlockHeader::new(BlockId(1), BlockUid(1), SnapshotId(1), size, CacheGroup::Leaf);
        assert!(Block::new(header).unwrap().payload().is_empty());
    }

    #[test]
    fn type_hashes_differ() {
        assert_ne!(type_hash("packtree::branch"), type_hash("packtree::leaf"));
        assert_eq!(type_hash("packtree::branch"), type_hash("packtree::branch"));
    }
}
