//! Branch nodes.
//!
//! A branch keeps two parallel structures: a sum tree with one row of absolute totals
//! (`[count, sum]`) per child and a plain array of child block IDs. Both always have the same
//! size.

use packtree_core::{
    accumulator::COUNT,
    packed::{
        ArrayView, FindResult, OutOfBlockSpace, PackedAllocator, PackedArray, PackedError,
        PackedSumTree, PackedView, SearchType, SumTreeView,
    },
    Accumulator, ACCUMULATOR_WIDTH,
};

use crate::block::BlockId;
use crate::error::{CapacityExceeded, Error, Result};

pub(crate) const SEGMENTS: usize = 2;

const ENTRIES: PackedSumTree = PackedSumTree::new(0);
const CHILDREN: PackedArray = PackedArray::new(1);

pub(crate) fn init<B: AsRef<[u8]> + AsMut<[u8]>>(
    alloc: &mut PackedAllocator<B>,
) -> std::result::Result<(), OutOfBlockSpace> {
    ENTRIES.init(alloc, ACCUMULATOR_WIDTH)?;
    CHILDREN.init(alloc)
}

fn to_row(totals: Accumulator) -> [u64; ACCUMULATOR_WIDTH] {
    match totals.to_totals() {
        Some(row) => row,
        None => panic!("negative branch entry {totals:?}"),
    }
}

/// Read access to a branch.
#[derive(Clone, Copy)]
pub struct BranchRef<'a> {
    entries: SumTreeView<'a>,
    children: ArrayView<'a>,
}

impl<'a> BranchRef<'a> {
    pub(crate) fn open(alloc: PackedAllocator<&'a [u8]>) -> std::result::Result<Self, PackedError> {
        let branch = BranchRef {
            entries: alloc.get_ref(ENTRIES.slot())?,
            children: alloc.get_ref(CHILDREN.slot())?,
        };
        if branch.entries.columns() != ACCUMULATOR_WIDTH {
            return Err(PackedError::InvalidLayout("branch entries have the wrong width"));
        }
        if branch.entries.size() != branch.children.size() {
            return Err(PackedError::InvalidLayout("branch entries and children disagree"));
        }
        Ok(branch)
    }

    fn trusted(alloc: PackedAllocator<&'a [u8]>) -> Self {
        BranchRef {
            entries: SumTreeView::from_segment(alloc.segment_ref(ENTRIES.slot())),
            children: ArrayView::from_segment(alloc.segment_ref(CHILDREN.slot())),
        }
    }

    pub fn size(&self) -> usize {
        self.children.size()
    }

    pub fn child(&self, idx: usize) -> BlockId {
        BlockId(self.children.get(idx))
    }

    pub fn children(&self, start: usize, end: usize) -> Vec<BlockId> {
        self.children.values(start, end).into_iter().map(BlockId).collect()
    }

    /// Index of `child`, if it is a child of this branch.
    pub fn position_of(&self, child: BlockId) -> Option<usize> {
        self.children.iter().position(|id| id == child.0)
    }

    /// The totals recorded for child `idx`.
    pub fn entry(&self, idx: usize) -> Accumulator {
        let mut totals = [0; ACCUMULATOR_WIDTH];
        for (col, total) in totals.iter_mut().enumerate() {
            *total = self.entries.value(idx, col);
        }
        Accumulator::from_totals(totals)
    }

    pub fn entries(&self, start: usize, end: usize) -> Vec<(BlockId, Accumulator)> {
        (start..end).map(|i| (self.child(i), self.entry(i))).collect()
    }

    /// Sum of the entries of children `0..idx`.
    pub fn prefix(&self, idx: usize) -> Accumulator {
        let mut totals = [0; ACCUMULATOR_WIDTH];
        for (col, total) in totals.iter_mut().enumerate() {
            *total = self.entries.prefix(col, idx);
        }
        Accumulator::from_totals(totals)
    }

    pub fn totals(&self) -> Accumulator {
        let mut totals = [0; ACCUMULATOR_WIDTH];
        for (col, total) in totals.iter_mut().enumerate() {
            *total = self.entries.total(col);
        }
        Accumulator::from_totals(totals)
    }

    /// The child whose running total of `column` first satisfies the search.
    ///
    /// `idx == size` if none does.
    pub fn find(&self, search: SearchType, column: usize, target: u64) -> FindResult {
        self.entries.find_forward(search, column, 0, target)
    }

    /// Number of leaf elements below this branch.
    pub fn count(&self) -> u64 {
        self.entries.total(COUNT)
    }

    pub fn check(&self) -> std::result::Result<(), PackedError> {
        self.entries.check(ENTRIES.slot())?;
        self.children.check()
    }
}

/// Write access to a branch.
pub struct BranchMut<'a> {
    alloc: PackedAllocator<&'a mut [u8]>,
}

impl<'a> BranchMut<'a> {
    pub(crate) fn new(alloc: PackedAllocator<&'a mut [u8]>) -> Self {
        BranchMut { alloc }
    }

    pub fn as_ref(&self) -> BranchRef<'_> {
        BranchRef::trusted(self.alloc.reborrow())
    }

    /// Insert `(child, totals)` entries before `idx`.
    ///
    /// Panics if any totals are negative.
    pub fn insert(
        &mut self,
        idx: usize,
        entries: &[(BlockId, Accumulator)],
    ) -> std::result::Result<(), CapacityExceeded> {
        let rows: Vec<u64> = entries.iter().flat_map(|(_, acc)| to_row(*acc)).collect();
        let ids: Vec<u64> = entries.iter().map(|(id, _)| id.0).collect();

        ENTRIES.insert(&mut self.alloc, idx, &rows)?;
        if let Err(e) = CHILDREN.insert(&mut self.alloc, idx, &ids) {
            ENTRIES.remove(&mut self.alloc, idx, idx + entries.len());
            return Err(e.into());
        }
        Ok(())
    }

    pub fn remove(&mut self, start: usize, end: usize) {
        CHILDREN.remove(&mut self.alloc, start, end);
        ENTRIES.remove(&mut self.alloc, start, end);
    }

    pub fn set_child(&mut self, idx: usize, child: BlockId) {
        CHILDREN.set(&mut self.alloc, idx, child.0);
    }

    /// Overwrite the totals of child `idx`.
    pub fn set_entry(&mut self, idx: usize, totals: Accumulator) {
        for (col, value) in to_row(totals).into_iter().enumerate() {
            ENTRIES.set_value(&mut self.alloc, idx, col, value);
        }
    }

    /// Add a delta to the totals of child `idx`.
    ///
    /// Entries are fixed width, so this never needs room. A delta that would make the totals
    /// negative means it does not belong to this child.
    pub fn add_to_entry(&mut self, idx: usize, delta: Accumulator) -> Result<()> {
        let current = self.as_ref().entry(idx);
        let updated = current + delta;
        if updated.to_totals().is_none() {
            return Err(Error::structural(format!(
                "delta {delta:?} underflows branch entry {current:?}"
            )));
        }
        self.set_entry(idx, updated);
        Ok(())
    }

    /// Move entries `idx..` to the front of `other`. On failure neither branch changes.
    pub fn split_to(
        &mut self,
        other: &mut BranchMut,
        idx: usize,
    ) -> std::result::Result<(), CapacityExceeded> {
        let moved = self.as_ref().entries(idx, self.as_ref().size());
        other.insert(0, &moved)?;
        self.remove(idx, idx + moved.len());
        Ok(())
    }

    /// Append all entries of `other`. On failure this branch is unchanged.
    pub fn merge_with(&mut self, other: &BranchRef) -> std::result::Result<(), CapacityExceeded> {
        let size = self.as_ref().size();
        self.insert(size, &other.entries(0, other.size()))
    }
}
