//! Multi-column sum tree.
//!
//! Here is the layout of the segment:
//!
//! ```rust,ignore
//! size: u32
//! columns: u32
//! values: [[u64; columns]; size]
//! index: see `index.rs`, over groups of VALUES_PER_BRANCH rows
//! ```
//!
//! Values are stored row-major so a row moves as one contiguous run during insertion,
//! removal, split and merge. The total of each column must fit a `u64`; the tree does not
//! check it.

use super::{
    allocator::PackedAllocator,
    index::{self, IndexLayout, IndexView, SearchType, VALUES_PER_BRANCH},
    read_u32, read_u64, write_u32, write_u64, OutOfBlockSpace, PackedError, PackedView,
    SegmentTag, ALIGNMENT,
};

const HEADER_SIZE: usize = 8;

/// Position found by a search, with the sum of the elements passed over to get there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FindResult {
    /// Index of the element at which the search stopped, or `size` if it ran off the end.
    pub idx: usize,
    /// Sum of the elements between the search start and `idx`, both exclusive of `idx`.
    pub prefix: u64,
}

fn groups(size: usize) -> usize {
    (size + VALUES_PER_BRANCH - 1) / VALUES_PER_BRANCH
}

fn index_layout(size: usize, columns: usize) -> IndexLayout {
    IndexLayout::new(groups(size), columns)
}

/// Bytes needed by a tree of `size` rows.
pub fn byte_size(size: usize, columns: usize) -> usize {
    HEADER_SIZE + size * columns * 8 + index_layout(size, columns).byte_size()
}

/// Read access to a sum tree.
#[derive(Clone, Copy)]
pub struct SumTreeView<'a> {
    bytes: &'a [u8],
}

impl<'a> PackedView<'a> for SumTreeView<'a> {
    const TAG: SegmentTag = SegmentTag::SUM_TREE;

    fn from_segment(bytes: &'a [u8]) -> Self {
        SumTreeView { bytes }
    }
}

impl<'a> SumTreeView<'a> {
    pub fn size(&self) -> usize {
        read_u32(self.bytes, 0) as usize
    }

    pub fn columns(&self) -> usize {
        read_u32(self.bytes, 4) as usize
    }

    fn value_offset(&self, idx: usize, column: usize) -> usize {
        HEADER_SIZE + (idx * self.columns() + column) * 8
    }

    pub fn value(&self, idx: usize, column: usize) -> u64 {
        assert!(idx < self.size() && column < self.columns());
        read_u64(self.bytes, self.value_offset(idx, column))
    }

    /// Rows `start..end`, flattened.
    pub fn rows(&self, start: usize, end: usize) -> Vec<u64> {
        assert!(start <= end && end <= self.size());
        let columns = self.columns();
        (start * columns..end * columns)
            .map(|i| read_u64(self.bytes, HEADER_SIZE + i * 8))
            .collect()
    }

    fn index(&self) -> IndexView<'a> {
        let size = self.size();
        let columns = self.columns();
        IndexView::new(
            index_layout(size, columns),
            &self.bytes[HEADER_SIZE + size * columns * 8..],
        )
    }

    fn group_sum(&self, group: usize, column: usize) -> u64 {
        let start = group * VALUES_PER_BRANCH;
        let end = (start + VALUES_PER_BRANCH).min(self.size());
        (start..end).map(|i| self.value(i, column)).sum()
    }

    /// Sum of `column` over rows `0..idx`.
    pub fn prefix(&self, column: usize, idx: usize) -> u64 {
        assert!(idx <= self.size());
        let index = self.index();
        if index.layout().is_empty() {
            return (0..idx).map(|i| self.value(i, column)).sum();
        }
        let group = idx / VALUES_PER_BRANCH;
        let in_group: u64 = (group * VALUES_PER_BRANCH..idx)
            .map(|i| self.value(i, column))
            .sum();
        index.prefix(column, group) + in_group
    }

    /// Sum of `column` over rows `start..end`.
    pub fn sum(&self, column: usize, start: usize, end: usize) -> u64 {
        self.prefix(column, end) - self.prefix(column, start)
    }

    pub fn total(&self, column: usize) -> u64 {
        let index = self.index();
        let depth = index.layout().depth();
        if depth == 0 {
            (0..self.size()).map(|i| self.value(i, column)).sum()
        } else {
            index.entry(depth - 1, 0, column)
        }
    }

    // The first row at which the running sum from row 0 satisfies the search, and the sum of
    // the rows before it. Runs off the end with `(size, total)`.
    fn search_from_start(&self, search: SearchType, column: usize, target: u64) -> (usize, u64) {
        let size = self.size();
        match self.index().descend(column, target, search) {
            None => (size, self.total(column)),
            Some((group, mut acc)) => {
                let start = group * VALUES_PER_BRANCH;
                let end = (start + VALUES_PER_BRANCH).min(size);
                for i in start..end {
                    let value = self.value(i, column);
                    if search.satisfied(acc + value, target) {
                        return (i, acc);
                    }
                    acc += value;
                }
                (size, acc)
            }
        }
    }

    /// Walk forward from `start`, summing `column`, and stop at the first row where the sum
    /// satisfies the search against `target`.
    pub fn find_forward(
        &self,
        search: SearchType,
        column: usize,
        start: usize,
        target: u64,
    ) -> FindResult {
        let size = self.size();
        if start >= size {
            return FindResult { idx: size, prefix: 0 };
        }

        let base = self.prefix(column, start);
        let (idx, prefix) = self.search_from_start(search, column, base.saturating_add(target));
        if idx < start {
            // a zero GE target was already reached before `start`, so `start` satisfies it.
            return FindResult { idx: start, prefix: 0 };
        }
        FindResult {
            idx,
            prefix: prefix - base,
        }
    }

    /// Walk backward from `start` (inclusive), summing `column`, and stop at the first row
    /// where the sum satisfies the search against `target`.
    ///
    /// Returns `None` if the search runs past row 0.
    pub fn find_backward(
        &self,
        search: SearchType,
        column: usize,
        start: usize,
        target: u64,
    ) -> Option<FindResult> {
        assert!(start < self.size());
        let end_prefix = self.prefix(column, start + 1);

        // sum(idx..=start) = end_prefix - prefix(idx), so the answer is the last row whose
        // prefix stays within `limit`, found as the first row whose inclusive prefix passes it.
        let (limit, inner) = match search {
            SearchType::GE => (end_prefix.checked_sub(target)?, SearchType::GT),
            SearchType::GT => {
                if end_prefix <= target {
                    return None;
                }
                (end_prefix - target, SearchType::GE)
            }
        };

        let (found, _) = self.search_from_start(inner, column, limit);
        let idx = found.min(start);
        Some(FindResult {
            idx,
            prefix: end_prefix - self.prefix(column, idx + 1),
        })
    }

    /// Verify that the segment length and the index agree with the stored values.
    pub fn check(&self, slot: usize) -> Result<(), PackedError> {
        if self.bytes.len() != byte_size(self.size(), self.columns()) {
            return Err(PackedError::InvalidLayout("sum tree length mismatch"));
        }
        index::check(&self.index(), slot, |group, column| self.group_sum(group, column))
    }
}

/// Handle to a sum tree stored in an allocator slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedSumTree {
    slot: usize,
}

impl PackedSumTree {
    pub const fn new(slot: usize) -> Self {
        PackedSumTree { slot }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn view<'a, B: AsRef<[u8]>>(
        &self,
        alloc: &'a PackedAllocator<B>,
    ) -> Result<SumTreeView<'a>, PackedError> {
        alloc.get(self.slot)
    }

    fn raw<'a, B: AsRef<[u8]>>(&self, alloc: &'a PackedAllocator<B>) -> SumTreeView<'a> {
        debug_assert_eq!(alloc.segment_header(self.slot).tag, SegmentTag::SUM_TREE);
        SumTreeView::from_segment(alloc.segment(self.slot))
    }

    /// Allocate an empty tree with `columns` columns.
    pub fn init<B: AsRef<[u8]> + AsMut<[u8]>>(
        &self,
        alloc: &mut PackedAllocator<B>,
        columns: usize,
    ) -> Result<(), OutOfBlockSpace> {
        assert!(columns > 0);
        alloc.allocate_space(self.slot, HEADER_SIZE, ALIGNMENT, SegmentTag::SUM_TREE)?;
        let seg = alloc.segment_mut(self.slot);
        write_u32(seg, 0, 0);
        write_u32(seg, 4, columns as u32);
        Ok(())
    }

    /// Insert flattened rows before `idx`.
    pub fn insert<B: AsRef<[u8]> + AsMut<[u8]>>(
        &self,
        alloc: &mut PackedAllocator<B>,
        idx: usize,
        rows: &[u64],
    ) -> Result<(), OutOfBlockSpace> {
        let view = self.raw(alloc);
        let size = view.size();
        let columns = view.columns();
        assert!(rows.len() % columns == 0);
        assert!(idx <= size);

        let count = rows.len() / columns;
        if count == 0 {
            return Ok(());
        }

        alloc.resize_segment(self.slot, byte_size(size + count, columns))?;
        let seg = alloc.segment_mut(self.slot);
        let row_bytes = columns * 8;
        seg.copy_within(
            HEADER_SIZE + idx * row_bytes..HEADER_SIZE + size * row_bytes,
            HEADER_SIZE + (idx + count) * row_bytes,
        );
        for (i, value) in rows.iter().enumerate() {
            write_u64(seg, HEADER_SIZE + idx * row_bytes + i * 8, *value);
        }
        write_u32(seg, 0, (size + count) as u32);
        reindex_segment(seg);
        Ok(())
    }

    /// Remove rows `start..end`.
    pub fn remove<B: AsRef<[u8]> + AsMut<[u8]>>(
        &self,
        alloc: &mut PackedAllocator<B>,
        start: usize,
        end: usize,
    ) {
        let view = self.raw(alloc);
        let size = view.size();
        let columns = view.columns();
        assert!(start <= end && end <= size);
        if start == end {
            return;
        }

        let seg = alloc.segment_mut(self.slot);
        let row_bytes = columns * 8;
        seg.copy_within(
            HEADER_SIZE + end * row_bytes..HEADER_SIZE + size * row_bytes,
            HEADER_SIZE + start * row_bytes,
        );
        let new_size = size - (end - start);
        write_u32(seg, 0, new_size as u32);
        reindex_segment(seg);
        alloc.shrink_segment(self.slot, byte_size(new_size, columns));
    }

    pub fn set_value<B: AsRef<[u8]> + AsMut<[u8]>>(
        &self,
        alloc: &mut PackedAllocator<B>,
        idx: usize,
        column: usize,
        value: u64,
    ) {
        let view = self.raw(alloc);
        assert!(idx < view.size() && column < view.columns());
        let offset = view.value_offset(idx, column);
        let seg = alloc.segment_mut(self.slot);
        write_u64(seg, offset, value);
        reindex_segment(seg);
    }

    /// Move rows `idx..` to the front of `other`.
    ///
    /// On failure neither tree is changed.
    pub fn split_to<B, O>(
        &self,
        alloc: &mut PackedAllocator<B>,
        other: &PackedSumTree,
        other_alloc: &mut PackedAllocator<O>,
        idx: usize,
    ) -> Result<(), OutOfBlockSpace>
    where
        B: AsRef<[u8]> + AsMut<[u8]>,
        O: AsRef<[u8]> + AsMut<[u8]>,
    {
        let view = self.raw(alloc);
        let size = view.size();
        assert_eq!(view.columns(), other.raw(other_alloc).columns());
        let rows = view.rows(idx, size);
        other.insert(other_alloc, 0, &rows)?;
        self.remove(alloc, idx, size);
        Ok(())
    }

    /// Append all rows of `other`.
    ///
    /// On failure this tree is unchanged.
    pub fn merge_with<B: AsRef<[u8]> + AsMut<[u8]>>(
        &self,
        alloc: &mut PackedAllocator<B>,
        other: &SumTreeView,
    ) -> Result<(), OutOfBlockSpace> {
        let size = self.raw(alloc).size();
        self.insert(alloc, size, &other.rows(0, other.size()))
    }

    /// Rebuild the index from the stored values.
    pub fn reindex<B: AsRef<[u8]> + AsMut<[u8]>>(&self, alloc: &mut PackedAllocator<B>) {
        reindex_segment(alloc.segment_mut(self.slot));
    }
}

fn reindex_segment(seg: &mut [u8]) {
    let size = read_u32(seg, 0) as usize;
    let columns = read_u32(seg, 4) as usize;
    let layout = index_layout(size, columns);
    if layout.is_empty() {
        return;
    }
    let (values, index_bytes) = seg.split_at_mut(HEADER_SIZE + size * columns * 8);
    index::rebuild(&layout, index_bytes, |group, column| {
        let start = group * VALUES_PER_BRANCH;
        let end = (start + VALUES_PER_BRANCH).min(size);
        (start..end)
            .map(|i| read_u64(values, HEADER_SIZE + (i * columns + column) * 8))
            .sum()
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::{Arbitrary, Gen, QuickCheck, TestResult};

    const TREE: PackedSumTree = PackedSumTree::new(0);

    fn alloc_with(rows: &[u64], columns: usize, size: usize) -> PackedAllocator<Vec<u8>> {
        let mut alloc = PackedAllocator::init(vec![0; size], 1).unwrap();
        TREE.init(&mut alloc, columns).unwrap();
        TREE.insert(&mut alloc, 0, rows).unwrap();
        alloc
    }

    fn linear_forward(values: &[u64], search: SearchType, start: usize, target: u64) -> FindResult {
        let mut acc = 0;
        for (i, v) in values.iter().enumerate().skip(start) {
            if search.satisfied(acc + v, target) {
                return FindResult { idx: i, prefix: acc };
            }
            acc += v;
        }
        FindResult {
            idx: values.len(),
            prefix: acc,
        }
    }

    fn linear_backward(
        values: &[u64],
        search: SearchType,
        start: usize,
        target: u64,
    ) -> Option<FindResult> {
        let mut acc = 0;
        for i in (0..=start).rev() {
            if search.satisfied(acc + values[i], target) {
                return Some(FindResult { idx: i, prefix: acc });
            }
            acc += values[i];
        }
        None
    }

    #[test]
    fn insert_and_remove_rows() {
        let mut alloc = alloc_with(&[1, 10, 2, 20, 3, 30], 2, 1024);
        TREE.insert(&mut alloc, 1, &[9, 90]).unwrap();
        let view = TREE.view(&alloc).unwrap();
        assert_eq!(view.size(), 4);
        assert_eq!(view.rows(0, 4), vec![1, 10, 9, 90, 2, 20, 3, 30]);
        assert_eq!(view.total(1), 150);

        TREE.remove(&mut alloc, 0, 2);
        let view = TREE.view(&alloc).unwrap();
        assert_eq!(view.rows(0, 2), vec![2, 20, 3, 30]);
        assert_eq!(view.prefix(0, 1), 2);
        view.check(0).unwrap();
    }

    #[test]
    fn large_tree_uses_index() {
        let values: Vec<u64> = (0..3000).map(|i| i % 7).collect();
        let alloc = alloc_with(&values, 1, 64 * 1024);
        let view = TREE.view(&alloc).unwrap();
        view.check(0).unwrap();
        assert_eq!(view.total(0), values.iter().sum::<u64>());
        for idx in [0, 1, 31, 32, 1024, 1025, 2999, 3000] {
            assert_eq!(view.prefix(0, idx), values[..idx].iter().sum::<u64>());
        }
        for target in [0, 1, 100, 5000, 8990, 8991, 9000] {
            for search in [SearchType::GE, SearchType::GT] {
                assert_eq!(
                    view.find_forward(search, 0, 0, target),
                    linear_forward(&values, search, 0, target),
                    "{search:?} {target}"
                );
            }
        }
    }

    #[test]
    fn overflow_leaves_tree_untouched() {
        let mut alloc = alloc_with(&[1, 2, 3], 1, 128);
        let before = alloc.as_bytes().to_vec();
        let too_many = vec![7u64; 64];
        assert!(TREE.insert(&mut alloc, 1, &too_many).is_err());
        assert_eq!(alloc.as_bytes(), &before[..]);
    }

    #[test]
    fn split_then_merge_restores_content() {
        let values: Vec<u64> = (0..100).collect();
        let mut left = alloc_with(&values, 1, 4096);
        let mut right = PackedAllocator::init(vec![0; 4096], 1).unwrap();
        TREE.init(&mut right, 1).unwrap();

        TREE.split_to(&mut left, &TREE, &mut right, 40).unwrap();
        assert_eq!(TREE.view(&left).unwrap().rows(0, 40), values[..40].to_vec());
        assert_eq!(TREE.view(&right).unwrap().rows(0, 60), values[40..].to_vec());

        let right_view = TREE.view(&right).unwrap();
        TREE.merge_with(&mut left, &right_view).unwrap();
        let merged = TREE.view(&left).unwrap();
        assert_eq!(merged.rows(0, merged.size()), values);
        merged.check(0).unwrap();
    }

    #[test]
    fn backward_search() {
        let values = [1, 2, 3, 0, 4];
        let alloc = alloc_with(&values, 1, 1024);
        let view = TREE.view(&alloc).unwrap();
        assert_eq!(
            view.find_backward(SearchType::GE, 0, 2, 3),
            Some(FindResult { idx: 2, prefix: 0 })
        );
        assert_eq!(
            view.find_backward(SearchType::GT, 0, 2, 3),
            Some(FindResult { idx: 1, prefix: 3 })
        );
        assert_eq!(view.find_backward(SearchType::GT, 0, 2, 6), None);
        assert_eq!(
            view.find_backward(SearchType::GE, 0, 4, 0),
            Some(FindResult { idx: 4, prefix: 0 })
        );
    }

    #[derive(Clone, Debug)]
    enum Op {
        Insert(usize, Vec<u64>),
        Remove(usize, usize),
        Set(usize, u64),
    }

    impl Arbitrary for Op {
        fn arbitrary(g: &mut Gen) -> Op {
            match u8::arbitrary(g) % 3 {
                0 => {
                    let n = usize::arbitrary(g) % 40;
                    Op::Insert(
                        usize::arbitrary(g),
                        (0..n).map(|_| u64::arbitrary(g) % 100).collect(),
                    )
                }
                1 => Op::Remove(usize::arbitrary(g), usize::arbitrary(g) % 40),
                _ => Op::Set(usize::arbitrary(g), u64::arbitrary(g) % 100),
            }
        }
    }

    fn matches_model(ops: Vec<Op>, probes: Vec<(u64, usize)>) -> TestResult {
        let mut model: Vec<u64> = Vec::new();
        let mut alloc = alloc_with(&[], 1, 256 * 1024);

        for op in ops {
            match op {
                Op::Insert(at, values) => {
                    let at = at % (model.len() + 1);
                    TREE.insert(&mut alloc, at, &values).unwrap();
                    model.splice(at..at, values);
                }
                Op::Remove(at, len) => {
                    if model.is_empty() {
                        continue;
                    }
                    let start = at % model.len();
                    let end = (start + len).min(model.len());
                    TREE.remove(&mut alloc, start, end);
                    model.drain(start..end);
                }
                Op::Set(at, value) => {
                    if model.is_empty() {
                        continue;
                    }
                    let at = at % model.len();
                    TREE.set_value(&mut alloc, at, 0, value);
                    model[at] = value;
                }
            }
        }

        let view = TREE.view(&alloc).unwrap();
        if view.check(0).is_err() || view.rows(0, view.size()) != model {
            return TestResult::failed();
        }
        for (target, start) in probes {
            let target = target % 2000;
            for search in [SearchType::GE, SearchType::GT] {
                let start_fw = start % (model.len() + 1);
                if view.find_forward(search, 0, start_fw, target)
                    != linear_forward(&model, search, start_fw, target)
                {
                    return TestResult::failed();
                }
                if !model.is_empty() {
                    let start_bw = start % model.len();
                    if view.find_backward(search, 0, start_bw, target)
                        != linear_backward(&model, search, start_bw, target)
                    {
                        return TestResult::failed();
                    }
                }
            }
        }
        TestResult::passed()
    }

    #[test]
    fn sum_tree_matches_model() {
        QuickCheck::new()
            .tests(100)
            .quickcheck(matches_model as fn(Vec<Op>, Vec<(u64, usize)>) -> TestResult)
    }
}
