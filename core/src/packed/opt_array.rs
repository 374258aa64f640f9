//! Sparse array of optional `u64` values.
//!
//! Two segments: a presence bitmap ([`PackedSeq`] with one bit per element) and a dense
//! [`PackedArray`] holding only the present values. `rank(idx, 1)` on the bitmap maps a
//! sparse index to its dense index, `select(1, n)` maps back.
//!
//! The two segments change together. Insertions update the bitmap first and then the dense
//! array; shrinking removes from the dense array first and then from the bitmap. When the
//! second step fails for lack of space the first one is undone, so a failed call leaves both
//! segments as they were.

use super::{
    allocator::PackedAllocator, array::PackedArray, seq::PackedSeq, ArrayView, OutOfBlockSpace,
    PackedError, PackedView, SeqView,
};

#[derive(Clone, Copy)]
pub struct OptArrayView<'a> {
    bitmap: SeqView<'a>,
    values: ArrayView<'a>,
}

impl<'a> OptArrayView<'a> {
    /// Pair a bitmap with its dense values. The caller has checked both tags.
    pub fn from_parts(bitmap: SeqView<'a>, values: ArrayView<'a>) -> Self {
        OptArrayView { bitmap, values }
    }

    pub fn size(&self) -> usize {
        self.bitmap.size()
    }

    /// Number of present values.
    pub fn present(&self) -> usize {
        self.values.size()
    }

    pub fn is_present(&self, idx: usize) -> bool {
        self.bitmap.symbol(idx) == 1
    }

    pub fn get(&self, idx: usize) -> Option<u64> {
        if self.is_present(idx) {
            Some(self.values.get(self.dense_index(idx)))
        } else {
            None
        }
    }

    /// Number of present values before `idx`: the dense index `idx` maps to.
    pub fn dense_index(&self, idx: usize) -> usize {
        self.bitmap.rank(idx, 1)
    }

    /// Sparse index of the `nth` present value.
    pub fn sparse_index(&self, nth: usize) -> Option<usize> {
        self.bitmap.select(1, nth)
    }

    pub fn entries(&self, start: usize, end: usize) -> Vec<Option<u64>> {
        (start..end).map(|i| self.get(i)).collect()
    }

    pub fn check(&self, slot: usize) -> Result<(), PackedError> {
        self.bitmap.check(slot)?;
        self.values.check()?;
        if self.bitmap.count(1) != self.values.size() {
            return Err(PackedError::InvalidLayout("bitmap and values disagree"));
        }
        Ok(())
    }
}

/// Handle to an optional array spanning two allocator slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedOptArray {
    bitmap: PackedSeq,
    values: PackedArray,
}

impl PackedOptArray {
    pub const fn new(bitmap_slot: usize, values_slot: usize) -> Self {
        PackedOptArray {
            bitmap: PackedSeq::new(bitmap_slot),
            values: PackedArray::new(values_slot),
        }
    }

    pub fn view<'a, B: AsRef<[u8]>>(
        &self,
        alloc: &'a PackedAllocator<B>,
    ) -> Result<OptArrayView<'a>, PackedError> {
        Ok(OptArrayView {
            bitmap: self.bitmap.view(alloc)?,
            values: self.values.view(alloc)?,
        })
    }

    fn raw<'a, B: AsRef<[u8]>>(&self, alloc: &'a PackedAllocator<B>) -> OptArrayView<'a> {
        OptArrayView {
            bitmap: SeqView::from_segment(alloc.segment(self.bitmap.slot())),
            values: ArrayView::from_segment(alloc.segment(self.values.slot())),
        }
    }

    pub fn init<B: AsRef<[u8]> + AsMut<[u8]>>(
        &self,
        alloc: &mut PackedAllocator<B>,
    ) -> Result<(), OutOfBlockSpace> {
        self.bitmap.init(alloc, 1)?;
        self.values.init(alloc)
    }

    pub fn insert<B: AsRef<[u8]> + AsMut<[u8]>>(
        &self,
        alloc: &mut PackedAllocator<B>,
        idx: usize,
        entries: &[Option<u64>],
    ) -> Result<(), OutOfBlockSpace> {
        let presence: Vec<u8> = entries.iter().map(|e| e.is_some() as u8).collect();
        let dense: Vec<u64> = entries.iter().flatten().copied().collect();

        self.bitmap.insert(alloc, idx, &presence)?;
        let dense_idx = self.raw(alloc).dense_index(idx);
        if let Err(e) = self.values.insert(alloc, dense_idx, &dense) {
            self.bitmap.remove(alloc, idx, idx + entries.len());
            return Err(e);
        }
        Ok(())
    }

    pub fn remove<B: AsRef<[u8]> + AsMut<[u8]>>(
        &self,
        alloc: &mut PackedAllocator<B>,
        start: usize,
        end: usize,
    ) {
        let view = self.raw(alloc);
        let dense_start = view.dense_index(start);
        let dense_end = view.dense_index(end);
        self.values.remove(alloc, dense_start, dense_end);
        self.bitmap.remove(alloc, start, end);
    }

    /// Replace the entry at `idx`.
    pub fn set<B: AsRef<[u8]> + AsMut<[u8]>>(
        &self,
        alloc: &mut PackedAllocator<B>,
        idx: usize,
        value: Option<u64>,
    ) -> Result<(), OutOfBlockSpace> {
        let view = self.raw(alloc);
        let dense_idx = view.dense_index(idx);
        match (view.is_present(idx), value) {
            (true, Some(v)) => self.values.set(alloc, dense_idx, v),
            (false, None) => {}
            (false, Some(v)) => {
                self.bitmap.set(alloc, idx, 1);
                if let Err(e) = self.values.insert(alloc, dense_idx, &[v]) {
                    self.bitmap.set(alloc, idx, 0);
                    return Err(e);
                }
            }
            (true, None) => {
                self.values.remove(alloc, dense_idx, dense_idx + 1);
                self.bitmap.set(alloc, idx, 0);
            }
        }
        Ok(())
    }

    /// Move entries `idx..` to the front of `other`. On failure neither array changes.
    pub fn split_to<B, O>(
        &self,
        alloc: &mut PackedAllocator<B>,
        other: &PackedOptArray,
        other_alloc: &mut PackedAllocator<O>,
        idx: usize,
    ) -> Result<(), OutOfBlockSpace>
    where
        B: AsRef<[u8]> + AsMut<[u8]>,
        O: AsRef<[u8]> + AsMut<[u8]>,
    {
        let view = self.raw(alloc);
        let size = view.size();
        let moved = view.entries(idx, size);
        other.insert(other_alloc, 0, &moved)?;
        self.remove(alloc, idx, size);
        Ok(())
    }

    /// Append all entries of `other`. On failure this array is unchanged.
    pub fn merge_with<B: AsRef<[u8]> + AsMut<[u8]>>(
        &self,
        alloc: &mut PackedAllocator<B>,
        other: &OptArrayView,
    ) -> Result<(), OutOfBlockSpace> {
        let size = self.raw(alloc).size();
        self.insert(alloc, size, &other.entries(0, other.size()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OPT: PackedOptArray = PackedOptArray::new(0, 1);

    fn alloc(size: usize) -> PackedAllocator<Vec<u8>> {
        let mut alloc = PackedAllocator::init(vec![0; size], 2).unwrap();
        OPT.init(&mut alloc).unwrap();
        alloc
    }

    #[test]
    fn sparse_and_dense_indexes() {
        let mut a = alloc(1024);
        OPT.insert(&mut a, 0, &[Some(10), None, None, Some(40), Some(50)]).unwrap();
        let view = OPT.view(&a).unwrap();
        assert_eq!(view.size(), 5);
        assert_eq!(view.present(), 3);
        assert_eq!(view.get(3), Some(40));
        assert_eq!(view.get(2), None);
        assert_eq!(view.dense_index(3), 1);
        assert_eq!(view.sparse_index(2), Some(4));
        view.check(0).unwrap();
    }

    #[test]
    fn set_switches_presence() {
        let mut a = alloc(1024);
        OPT.insert(&mut a, 0, &[Some(1), None, Some(3)]).unwrap();
        OPT.set(&mut a, 1, Some(2)).unwrap();
        OPT.set(&mut a, 0, None).unwrap();
        OPT.set(&mut a, 2, Some(30)).unwrap();
        let view = OPT.view(&a).unwrap();
        assert_eq!(view.entries(0, 3), vec![None, Some(2), Some(30)]);
        view.check(0).unwrap();
    }

    #[test]
    fn failed_insert_reverts_bitmap() {
        let mut a = alloc(160);
        OPT.insert(&mut a, 0, &[Some(1), Some(2)]).unwrap();
        let before = a.as_bytes().to_vec();
        let many = vec![Some(9u64); 16];
        assert!(OPT.insert(&mut a, 1, &many).is_err());
        assert_eq!(a.as_bytes(), &before[..]);

        // absent entries only touch the bitmap, which still has room.
        OPT.insert(&mut a, 1, &[None, None]).unwrap();
        assert_eq!(
            OPT.view(&a).unwrap().entries(0, 4),
            vec![Some(1), None, None, Some(2)]
        );
    }

    #[test]
    fn remove_range() {
        let mut a = alloc(1024);
        let entries: Vec<Option<u64>> = (0..20).map(|i| (i % 3 != 0).then_some(i)).collect();
        OPT.insert(&mut a, 0, &entries).unwrap();
        OPT.remove(&mut a, 4, 13);
        let mut expected = entries.clone();
        expected.drain(4..13);
        let view = OPT.view(&a).unwrap();
        assert_eq!(view.entries(0, view.size()), expected);
        view.check(0).unwrap();
    }
}
