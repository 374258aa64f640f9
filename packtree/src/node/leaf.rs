//! Leaf nodes.
//!
//! Every layout keeps a one-column sum tree in slot 0 holding the value the leaf is indexed
//! by: the value itself for sequences, the key delta for maps, the byte length for blobs.
//! Maps add an optional-value array (slots 1 and 2), blob leaves an array of blob block IDs
//! (slot 1).

use packtree_core::{
    packed::{
        ArrayView, FindResult, OptArrayView, OutOfBlockSpace, PackedAllocator, PackedArray,
        PackedError, PackedOptArray, PackedSumTree, PackedView, SearchType, SeqView, SumTreeView,
    },
    Accumulator,
};

use super::LeafLayout;
use crate::block::BlockId;
use crate::error::CapacityExceeded;

const INDEXED: PackedSumTree = PackedSumTree::new(0);
const MAP_VALUES: PackedOptArray = PackedOptArray::new(1, 2);
const BLOBS: PackedArray = PackedArray::new(1);

pub(crate) fn segments(layout: LeafLayout) -> usize {
    match layout {
        LeafLayout::Sequence => 1,
        LeafLayout::Map => 3,
        LeafLayout::Blob => 2,
    }
}

pub(crate) fn init<B: AsRef<[u8]> + AsMut<[u8]>>(
    alloc: &mut PackedAllocator<B>,
    layout: LeafLayout,
) -> Result<(), OutOfBlockSpace> {
    INDEXED.init(alloc, 1)?;
    match layout {
        LeafLayout::Sequence => Ok(()),
        LeafLayout::Map => MAP_VALUES.init(alloc),
        LeafLayout::Blob => BLOBS.init(alloc),
    }
}

/// The largest entry a leaf of `layout` can be asked to hold.
pub(crate) fn worst_case_entry(layout: LeafLayout) -> LeafEntry {
    match layout {
        LeafLayout::Sequence => LeafEntry::Value(1),
        LeafLayout::Map => LeafEntry::Key {
            delta: 1,
            value: Some(1),
        },
        LeafLayout::Blob => LeafEntry::Blob {
            len: 1,
            block: BlockId(1),
        },
    }
}

/// One leaf entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafEntry {
    Value(u64),
    /// A map key, stored as the distance to the previous key, and its value.
    Key { delta: u64, value: Option<u64> },
    /// A blob of `len` bytes kept in `block`.
    Blob { len: u64, block: BlockId },
}

impl LeafEntry {
    /// The value the leaf index sums.
    pub fn indexed(&self) -> u64 {
        match *self {
            LeafEntry::Value(v) => v,
            LeafEntry::Key { delta, .. } => delta,
            LeafEntry::Blob { len, .. } => len,
        }
    }

    pub fn layout(&self) -> LeafLayout {
        match self {
            LeafEntry::Value(_) => LeafLayout::Sequence,
            LeafEntry::Key { .. } => LeafLayout::Map,
            LeafEntry::Blob { .. } => LeafLayout::Blob,
        }
    }
}

#[derive(Clone, Copy)]
enum Extra<'a> {
    Sequence,
    Map(OptArrayView<'a>),
    Blob(ArrayView<'a>),
}

/// Read access to a leaf.
#[derive(Clone, Copy)]
pub struct LeafRef<'a> {
    indexed: SumTreeView<'a>,
    extra: Extra<'a>,
}

impl<'a> LeafRef<'a> {
    pub(crate) fn open(
        alloc: PackedAllocator<&'a [u8]>,
        layout: LeafLayout,
    ) -> Result<Self, PackedError> {
        let indexed: SumTreeView = alloc.get_ref(INDEXED.slot())?;
        if indexed.columns() != 1 {
            return Err(PackedError::InvalidLayout("leaf index has the wrong width"));
        }
        let extra = match layout {
            LeafLayout::Sequence => Extra::Sequence,
            LeafLayout::Map => {
                let bitmap: SeqView = alloc.get_ref(1)?;
                let values: ArrayView = alloc.get_ref(2)?;
                Extra::Map(OptArrayView::from_parts(bitmap, values))
            }
            LeafLayout::Blob => Extra::Blob(alloc.get_ref(BLOBS.slot())?),
        };
        let leaf = LeafRef { indexed, extra };
        let consistent = match leaf.extra {
            Extra::Sequence => true,
            Extra::Map(values) => values.size() == indexed.size(),
            Extra::Blob(blobs) => blobs.size() == indexed.size(),
        };
        if !consistent {
            return Err(PackedError::InvalidLayout("leaf structures disagree on size"));
        }
        Ok(leaf)
    }

    fn trusted(alloc: PackedAllocator<&'a [u8]>, layout: LeafLayout) -> Self {
        let extra = match layout {
            LeafLayout::Sequence => Extra::Sequence,
            LeafLayout::Map => Extra::Map(OptArrayView::from_parts(
                SeqView::from_segment(alloc.segment_ref(1)),
                ArrayView::from_segment(alloc.segment_ref(2)),
            )),
            LeafLayout::Blob => {
                Extra::Blob(ArrayView::from_segment(alloc.segment_ref(BLOBS.slot())))
            }
        };
        LeafRef {
            indexed: SumTreeView::from_segment(alloc.segment_ref(INDEXED.slot())),
            extra,
        }
    }

    pub fn layout(&self) -> LeafLayout {
        match self.extra {
            Extra::Sequence => LeafLayout::Sequence,
            Extra::Map(_) => LeafLayout::Map,
            Extra::Blob(_) => LeafLayout::Blob,
        }
    }

    pub fn size(&self) -> usize {
        self.indexed.size()
    }

    /// The indexed value of entry `idx`.
    pub fn indexed(&self, idx: usize) -> u64 {
        self.indexed.value(idx, 0)
    }

    pub fn entry(&self, idx: usize) -> LeafEntry {
        let indexed = self.indexed(idx);
        match self.extra {
            Extra::Sequence => LeafEntry::Value(indexed),
            Extra::Map(values) => LeafEntry::Key {
                delta: indexed,
                value: values.get(idx),
            },
            Extra::Blob(blobs) => LeafEntry::Blob {
                len: indexed,
                block: BlockId(blobs.get(idx)),
            },
        }
    }

    pub fn entries(&self, start: usize, end: usize) -> Vec<LeafEntry> {
        (start..end).map(|i| self.entry(i)).collect()
    }

    /// Sum of the indexed values of entries `0..idx`.
    pub fn prefix(&self, idx: usize) -> u64 {
        self.indexed.prefix(0, idx)
    }

    pub fn totals(&self) -> Accumulator {
        Accumulator::from_totals([self.size() as u64, self.indexed.total(0)])
    }

    /// The entry at which the running sum of indexed values first satisfies the search.
    pub fn find(&self, search: SearchType, target: u64) -> FindResult {
        self.indexed.find_forward(search, 0, 0, target)
    }

    /// Blob blocks referenced by entries `start..end`. Empty for other layouts.
    pub fn blob_blocks(&self, start: usize, end: usize) -> Vec<BlockId> {
        match self.extra {
            Extra::Blob(blobs) => blobs.values(start, end).into_iter().map(BlockId).collect(),
            _ => Vec::new(),
        }
    }

    pub fn check(&self) -> Result<(), PackedError> {
        self.indexed.check(INDEXED.slot())?;
        match self.extra {
            Extra::Sequence => Ok(()),
            Extra::Map(values) => values.check(1),
            Extra::Blob(blobs) => blobs.check(),
        }
    }
}

/// Write access to a leaf.
pub struct LeafMut<'a> {
    layout: LeafLayout,
    alloc: PackedAllocator<&'a mut [u8]>,
}

impl<'a> LeafMut<'a> {
    pub(crate) fn new(alloc: PackedAllocator<&'a mut [u8]>, layout: LeafLayout) -> Self {
        LeafMut { layout, alloc }
    }

    pub fn layout(&self) -> LeafLayout {
        self.layout
    }

    pub fn as_ref(&self) -> LeafRef<'_> {
        LeafRef::trusted(self.alloc.reborrow(), self.layout)
    }

    /// Insert entries before `idx`. On failure the leaf is unchanged.
    ///
    /// Panics if an entry does not belong to this layout.
    pub fn insert(&mut self, idx: usize, entries: &[LeafEntry]) -> Result<(), CapacityExceeded> {
        assert!(
            entries.iter().all(|e| e.layout() == self.layout),
            "entry does not match {:?} leaf",
            self.layout
        );
        let indexed: Vec<u64> = entries.iter().map(LeafEntry::indexed).collect();
        INDEXED.insert(&mut self.alloc, idx, &indexed)?;

        let extra = match self.layout {
            LeafLayout::Sequence => Ok(()),
            LeafLayout::Map => {
                let values: Vec<Option<u64>> = entries
                    .iter()
                    .map(|e| match e {
                        LeafEntry::Key { value, .. } => *value,
                        _ => None,
                    })
                    .collect();
                MAP_VALUES.insert(&mut self.alloc, idx, &values)
            }
            LeafLayout::Blob => {
                let ids: Vec<u64> = entries
                    .iter()
                    .filter_map(|e| match e {
                        LeafEntry::Blob { block, .. } => Some(block.0),
                        _ => None,
                    })
                    .collect();
                BLOBS.insert(&mut self.alloc, idx, &ids)
            }
        };
        if let Err(e) = extra {
            INDEXED.remove(&mut self.alloc, idx, idx + entries.len());
            return Err(e.into());
        }
        Ok(())
    }

    /// Insert a map key given as its delta to the previous key, keeping the key that follows
    /// it in this leaf in place.
    pub fn insert_key(
        &mut self,
        idx: usize,
        delta: u64,
        value: Option<u64>,
    ) -> Result<(), CapacityExceeded> {
        self.insert(idx, &[LeafEntry::Key { delta, value }])?;
        if idx + 1 < self.as_ref().size() {
            let next = self.as_ref().indexed(idx + 1);
            self.set_indexed(idx + 1, next - delta);
        }
        Ok(())
    }

    pub fn remove(&mut self, start: usize, end: usize) {
        match self.layout {
            LeafLayout::Sequence => {}
            LeafLayout::Map => MAP_VALUES.remove(&mut self.alloc, start, end),
            LeafLayout::Blob => BLOBS.remove(&mut self.alloc, start, end),
        }
        INDEXED.remove(&mut self.alloc, start, end);
    }

    /// Overwrite the indexed value of entry `idx`.
    pub fn set_indexed(&mut self, idx: usize, value: u64) {
        INDEXED.set_value(&mut self.alloc, idx, 0, value);
    }

    /// Replace the value of map entry `idx`.
    pub fn set_map_value(
        &mut self,
        idx: usize,
        value: Option<u64>,
    ) -> Result<(), CapacityExceeded> {
        assert_eq!(self.layout, LeafLayout::Map);
        MAP_VALUES.set(&mut self.alloc, idx, value)?;
        Ok(())
    }

    /// Move entries `idx..` to the front of `other`. On failure neither leaf changes.
    pub fn split_to(&mut self, other: &mut LeafMut, idx: usize) -> Result<(), CapacityExceeded> {
        let size = self.as_ref().size();
        let moved = self.as_ref().entries(idx, size);
        other.insert(0, &moved)?;
        self.remove(idx, size);
        Ok(())
    }

    /// Append all entries of `other`. On failure this leaf is unchanged.
    pub fn merge_with(&mut self, other: &LeafRef) -> Result<(), CapacityExceeded> {
        let size = self.as_ref().size();
        self.insert(size, &other.entries(0, other.size()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{self, NodeHeader, NodeKind, NodeMut};

    fn leaf(layout: LeafLayout, size: usize) -> Vec<u8> {
        let mut payload = vec![0; size];
        node::init(
            &mut payload,
            NodeHeader {
                kind: NodeKind::Leaf(layout),
                level: 0,
                root: true,
            },
        )
        .unwrap();
        payload
    }

    fn open(payload: &mut [u8]) -> LeafMut<'_> {
        match NodeMut::open(payload).unwrap() {
            NodeMut::Leaf(l) => l,
            NodeMut::Branch(_) => panic!("not a leaf"),
        }
    }

    #[test]
    fn sequence_sums() {
        let mut payload = leaf(LeafLayout::Sequence, 1024);
        let mut l = open(&mut payload);
        let values: Vec<LeafEntry> = [4, 0, 7, 1].into_iter().map(LeafEntry::Value).collect();
        l.insert(0, &values).unwrap();

        let view = l.as_ref();
        assert_eq!(view.totals(), Accumulator::new(4, 12));
        assert_eq!(view.prefix(3), 11);
        // offset 5 is covered by the third value.
        assert_eq!(view.find(SearchType::GT, 5).idx, 2);
        assert!(view.blob_blocks(0, 4).is_empty());
    }

    #[test]
    fn map_keys_are_deltas() {
        let mut payload = leaf(LeafLayout::Map, 1024);
        let mut l = open(&mut payload);
        // keys 10 and 30.
        l.insert_key(0, 10, Some(1)).unwrap();
        l.insert_key(1, 20, None).unwrap();
        // key 25 goes between them: delta 15 from 10, and 30 becomes 5 past 25.
        l.insert_key(1, 15, Some(3)).unwrap();

        let view = l.as_ref();
        assert_eq!(
            view.entries(0, 3),
            vec![
                LeafEntry::Key { delta: 10, value: Some(1) },
                LeafEntry::Key { delta: 15, value: Some(3) },
                LeafEntry::Key { delta: 5, value: None },
            ]
        );
        assert_eq!(view.totals().sum(), 30);
        // first key >= 26 is the third.
        assert_eq!(view.find(SearchType::GE, 26).idx, 2);
    }

    #[test]
    fn map_value_update_can_run_out_of_room() {
        let mut payload = leaf(LeafLayout::Map, 512);
        let mut l = open(&mut payload);
        let mut n = 0;
        while l.insert(n, &[LeafEntry::Key { delta: 1, value: None }]).is_ok() {
            n += 1;
        }
        let before = l.as_ref().entries(0, n);
        // the bitmap still flips, but the dense array has no room for the value.
        let mut failed = false;
        for i in 0..n {
            if l.set_map_value(i, Some(7)).is_err() {
                failed = true;
                break;
            }
        }
        assert!(failed);
        let after = l.as_ref().entries(0, n);
        assert_eq!(after.len(), before.len());
        l.as_ref().check().unwrap();
    }

    #[test]
    fn blob_leaf_lists_blocks() {
        let mut payload = leaf(LeafLayout::Blob, 1024);
        let mut l = open(&mut payload);
        l.insert(
            0,
            &[
                LeafEntry::Blob { len: 100, block: BlockId(5) },
                LeafEntry::Blob { len: 3, block: BlockId(9) },
            ],
        )
        .unwrap();
        let view = l.as_ref();
        assert_eq!(view.blob_blocks(0, 2), vec![BlockId(5), BlockId(9)]);
        assert_eq!(view.totals(), Accumulator::new(2, 103));

        l.remove(0, 1);
        assert_eq!(l.as_ref().blob_blocks(0, 1), vec![BlockId(9)]);
    }

    #[test]
    #[should_panic]
    fn foreign_entry_panics() {
        let mut payload = leaf(LeafLayout::Sequence, 1024);
        let mut l = open(&mut payload);
        let _ = l.insert(0, &[LeafEntry::Key { delta: 1, value: None }]);
    }
}
