//! Tree nodes.
//!
//! A node is a block payload laid out as follows:
//!
//! ```rust,ignore
//! kind: u8                // 0 for branches, 1 + layout code for leaves
//! level: u8               // 0 for leaves
//! flags: u8               // bit 0: root
//! _reserved: [u8; 5]
//! allocator: PackedAllocator
//! ```
//!
//! Branches and leaves share the layout. Which packed structures the allocator holds depends
//! on the kind; the root flag is only a role and can be set on or cleared from any node.

use packtree_core::{
    packed::{OutOfBlockSpace, PackedAllocator, PackedError},
    Accumulator,
};

use crate::block::{type_hash, BlockId};
use crate::error::{CapacityExceeded, Error, Result};

pub mod branch;
pub mod leaf;

pub use branch::{BranchMut, BranchRef};
pub use leaf::{LeafEntry, LeafMut, LeafRef};

/// Size of the node header preceding the allocator.
pub const NODE_HEADER_SIZE: usize = 8;

const ROOT_FLAG: u8 = 1;

/// How a leaf stores its entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LeafLayout {
    /// A sequence of `u64` values, summed.
    Sequence,
    /// Sorted `u64` keys with optional `u64` values. Keys are stored as deltas.
    Map,
    /// A sequence of references to blob blocks, summed by length.
    Blob,
}

impl LeafLayout {
    pub const ALL: [LeafLayout; 3] = [LeafLayout::Sequence, LeafLayout::Map, LeafLayout::Blob];

    fn code(self) -> u8 {
        match self {
            LeafLayout::Sequence => 0,
            LeafLayout::Map => 1,
            LeafLayout::Blob => 2,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => LeafLayout::Sequence,
            1 => LeafLayout::Map,
            2 => LeafLayout::Blob,
            _ => return None,
        })
    }

    /// Hash identifying containers of this layout.
    pub fn ctr_type_hash(self) -> u64 {
        type_hash(match self {
            LeafLayout::Sequence => "packtree::container::sequence",
            LeafLayout::Map => "packtree::container::map",
            LeafLayout::Blob => "packtree::container::blob",
        })
    }
}

/// What a node is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Branch,
    Leaf(LeafLayout),
}

impl NodeKind {
    pub fn is_leaf(self) -> bool {
        matches!(self, NodeKind::Leaf(_))
    }

    /// Hash identifying the payload type of blocks holding this kind of node.
    pub fn block_type_hash(self) -> u64 {
        type_hash(match self {
            NodeKind::Branch => "packtree::node::branch",
            NodeKind::Leaf(LeafLayout::Sequence) => "packtree::node::leaf::sequence",
            NodeKind::Leaf(LeafLayout::Map) => "packtree::node::leaf::map",
            NodeKind::Leaf(LeafLayout::Blob) => "packtree::node::leaf::blob",
        })
    }

    fn segments(self) -> usize {
        match self {
            NodeKind::Branch => branch::SEGMENTS,
            NodeKind::Leaf(layout) => leaf::segments(layout),
        }
    }
}

/// Hash identifying the payload type of blob blocks.
pub fn blob_type_hash() -> u64 {
    type_hash("packtree::blob")
}

/// The fixed header at the start of a node payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeHeader {
    pub kind: NodeKind,
    pub level: u8,
    pub root: bool,
}

impl NodeHeader {
    pub fn encode_to(&self, buf: &mut [u8]) {
        assert_eq!(buf.len(), NODE_HEADER_SIZE);
        buf.fill(0);
        buf[0] = match self.kind {
            NodeKind::Branch => 0,
            NodeKind::Leaf(layout) => 1 + layout.code(),
        };
        buf[1] = self.level;
        buf[2] = if self.root { ROOT_FLAG } else { 0 };
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() < NODE_HEADER_SIZE {
            return Err(Error::structural("node payload truncated"));
        }
        let kind = match payload[0] {
            0 => NodeKind::Branch,
            code => NodeKind::Leaf(
                LeafLayout::from_code(code - 1)
                    .ok_or_else(|| Error::structural(format!("unknown node kind {code}")))?,
            ),
        };
        let level = payload[1];
        if kind.is_leaf() != (level == 0) {
            return Err(Error::structural(format!(
                "{kind:?} node at level {level}"
            )));
        }
        Ok(NodeHeader {
            kind,
            level,
            root: payload[2] & ROOT_FLAG != 0,
        })
    }
}

/// Lay out an empty node in `payload`.
pub fn init(payload: &mut [u8], header: NodeHeader) -> std::result::Result<(), OutOfBlockSpace> {
    header.encode_to(&mut payload[..NODE_HEADER_SIZE]);
    let mut alloc =
        PackedAllocator::init(&mut payload[NODE_HEADER_SIZE..], header.kind.segments())?;
    match header.kind {
        NodeKind::Branch => branch::init(&mut alloc),
        NodeKind::Leaf(layout) => leaf::init(&mut alloc, layout),
    }
}

/// Set or clear the root flag of the node in `payload`.
pub fn set_root(payload: &mut [u8], root: bool) {
    if root {
        payload[2] |= ROOT_FLAG;
    } else {
        payload[2] &= !ROOT_FLAG;
    }
}

/// The number of worst-case entries a node of `kind` holds in a payload of `payload_size`
/// bytes.
pub fn physical_capacity(kind: NodeKind, payload_size: usize) -> usize {
    let mut payload = vec![0; payload_size];
    let header = NodeHeader {
        kind,
        level: if kind.is_leaf() { 0 } else { 1 },
        root: false,
    };
    if init(&mut payload, header).is_err() {
        return 0;
    }
    let Ok(mut node) = NodeMut::open(&mut payload) else {
        return 0;
    };

    let mut count = 0;
    loop {
        let fits = match node {
            NodeMut::Branch(ref mut b) => b
                .insert(count, &[(BlockId(1), Accumulator::new(1, 1))])
                .is_ok(),
            NodeMut::Leaf(ref mut l) => {
                let entry = leaf::worst_case_entry(l.layout());
                l.insert(count, &[entry]).is_ok()
            }
        };
        if !fits {
            return count;
        }
        count += 1;
    }
}

/// Read access to a node of either kind.
pub enum NodeRef<'a> {
    Branch(BranchRef<'a>),
    Leaf(LeafRef<'a>),
}

impl<'a> NodeRef<'a> {
    /// Open the node in `payload`, checking its header and the tags of its segments.
    pub fn open(payload: &'a [u8]) -> Result<(NodeHeader, Self)> {
        let header = NodeHeader::decode(payload)?;
        let alloc = PackedAllocator::open(&payload[NODE_HEADER_SIZE..])?;
        if alloc.segments() != header.kind.segments() {
            return Err(PackedError::InvalidLayout("segment count does not match node kind").into());
        }
        let node = match header.kind {
            NodeKind::Branch => NodeRef::Branch(BranchRef::open(alloc)?),
            NodeKind::Leaf(layout) => NodeRef::Leaf(LeafRef::open(alloc, layout)?),
        };
        Ok((header, node))
    }

    pub fn size(&self) -> usize {
        match self {
            NodeRef::Branch(b) => b.size(),
            NodeRef::Leaf(l) => l.size(),
        }
    }

    pub fn totals(&self) -> Accumulator {
        match self {
            NodeRef::Branch(b) => b.totals(),
            NodeRef::Leaf(l) => l.totals(),
        }
    }

    /// Blocks referenced from this node: children of a branch, blob blocks of a leaf.
    pub fn references(&self) -> Vec<BlockId> {
        match self {
            NodeRef::Branch(b) => b.children(0, b.size()),
            NodeRef::Leaf(l) => l.blob_blocks(0, l.size()),
        }
    }

    /// Verify every packed structure against its index.
    pub fn check(&self) -> std::result::Result<(), PackedError> {
        match self {
            NodeRef::Branch(b) => b.check(),
            NodeRef::Leaf(l) => l.check(),
        }
    }
}

/// Write access to a node of either kind.
pub enum NodeMut<'a> {
    Branch(BranchMut<'a>),
    Leaf(LeafMut<'a>),
}

impl<'a> NodeMut<'a> {
    pub fn open(payload: &'a mut [u8]) -> Result<Self> {
        // validate through the read path first.
        let (header, _) = NodeRef::open(payload)?;
        let alloc = PackedAllocator::open(&mut payload[NODE_HEADER_SIZE..])?;
        Ok(match header.kind {
            NodeKind::Branch => NodeMut::Branch(BranchMut::new(alloc)),
            NodeKind::Leaf(layout) => NodeMut::Leaf(LeafMut::new(alloc, layout)),
        })
    }

    pub fn as_ref(&self) -> NodeRef<'_> {
        match self {
            NodeMut::Branch(b) => NodeRef::Branch(b.as_ref()),
            NodeMut::Leaf(l) => NodeRef::Leaf(l.as_ref()),
        }
    }

    pub fn remove(&mut self, start: usize, end: usize) {
        match self {
            NodeMut::Branch(b) => b.remove(start, end),
            NodeMut::Leaf(l) => l.remove(start, end),
        }
    }

    /// Move entries `idx..` to the front of `other`, a node of the same kind.
    pub fn split_to(
        &mut self,
        other: &mut NodeMut,
        idx: usize,
    ) -> std::result::Result<(), CapacityExceeded> {
        match (self, other) {
            (NodeMut::Branch(b), NodeMut::Branch(o)) => b.split_to(o, idx),
            (NodeMut::Leaf(l), NodeMut::Leaf(o)) => l.split_to(o, idx),
            _ => panic!("split between nodes of different kinds"),
        }
    }

    /// Append all entries of `other`, a node of the same kind.
    pub fn merge_with(&mut self, other: &NodeRef) -> std::result::Result<(), CapacityExceeded> {
        match (self, other) {
            (NodeMut::Branch(b), NodeRef::Branch(o)) => b.merge_with(o),
            (NodeMut::Leaf(l), NodeRef::Leaf(o)) => l.merge_with(o),
            _ => panic!("merge between nodes of different kinds"),
        }
    }

    /// Append the first `count` entries of `from`, removing them there.
    pub fn take_front(
        &mut self,
        from: &mut NodeMut,
        count: usize,
    ) -> std::result::Result<(), CapacityExceeded> {
        match (self, from) {
            (NodeMut::Branch(b), NodeMut::Branch(f)) => {
                let entries = f.as_ref().entries(0, count);
                let size = b.as_ref().size();
                b.insert(size, &entries)?;
                f.remove(0, count);
            }
            (NodeMut::Leaf(l), NodeMut::Leaf(f)) => {
                let entries = f.as_ref().entries(0, count);
                let size = l.as_ref().size();
                l.insert(size, &entries)?;
                f.remove(0, count);
            }
            _ => panic!("entries moved between nodes of different kinds"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let header = NodeHeader {
            kind: NodeKind::Leaf(LeafLayout::Map),
            level: 0,
            root: true,
        };
        let mut buf = [0xaa; NODE_HEADER_SIZE];
        header.encode_to(&mut buf);
        assert_eq!(NodeHeader::decode(&buf).unwrap(), header);

        set_root(&mut buf, false);
        assert!(!NodeHeader::decode(&buf).unwrap().root);
    }

    #[test]
    fn header_rejects_leaf_above_level_zero() {
        let mut buf = [0; NODE_HEADER_SIZE];
        NodeHeader {
            kind: NodeKind::Leaf(LeafLayout::Sequence),
            level: 0,
            root: false,
        }
        .encode_to(&mut buf);
        buf[1] = 2;
        assert!(NodeHeader::decode(&buf).is_err());
    }

    #[test]
    fn physical_capacities_are_sane() {
        let payload = 4096 - crate::block::HEADER_SIZE;
        for kind in [
            NodeKind::Branch,
            NodeKind::Leaf(LeafLayout::Sequence),
            NodeKind::Leaf(LeafLayout::Map),
            NodeKind::Leaf(LeafLayout::Blob),
        ] {
            let cap = physical_capacity(kind, payload);
            assert!(cap > 100, "{kind:?} holds only {cap}");
            assert!(cap < payload / 8, "{kind:?} holds {cap}");
        }
        // maps carry a value next to every key.
        assert!(
            physical_capacity(NodeKind::Leaf(LeafLayout::Map), payload)
                < physical_capacity(NodeKind::Leaf(LeafLayout::Sequence), payload)
        );
    }

    #[test]
    fn split_then_merge_restores_content() {
        let payload_size = 1024;
        let header = NodeHeader {
            kind: NodeKind::Leaf(LeafLayout::Map),
            level: 0,
            root: false,
        };
        let mut left = vec![0; payload_size];
        let mut right = vec![0; payload_size];
        init(&mut left, header).unwrap();
        init(&mut right, header).unwrap();

        let entries: Vec<LeafEntry> = (0..20)
            .map(|i| LeafEntry::Key {
                delta: i + 1,
                value: (i % 2 == 0).then_some(i * 10),
            })
            .collect();
        {
            let mut l = NodeMut::open(&mut left).unwrap();
            let NodeMut::Leaf(ref mut leaf) = l else { panic!() };
            leaf.insert(0, &entries).unwrap();
        }
        let original = left.clone();

        {
            let mut l = NodeMut::open(&mut left).unwrap();
            let mut r = NodeMut::open(&mut right).unwrap();
            l.split_to(&mut r, 7).unwrap();
            assert_eq!(l.as_ref().size(), 7);
            assert_eq!(r.as_ref().size(), 13);
        }
        {
            let mut l = NodeMut::open(&mut left).unwrap();
            let (_, r) = NodeRef::open(&right).unwrap();
            l.merge_with(&r).unwrap();
        }
        let (_, merged) = NodeRef::open(&left).unwrap();
        let (_, before) = NodeRef::open(&original).unwrap();
        let (NodeRef::Leaf(merged), NodeRef::Leaf(before)) = (merged, before) else {
            panic!()
        };
        assert_eq!(merged.entries(0, 20), before.entries(0, 20));
        assert_eq!(merged.totals(), before.totals());
        merged.check().unwrap();
    }
}
