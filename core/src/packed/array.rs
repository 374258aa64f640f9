//! Plain array of `u64` without an index.
//!
//! ```rust,ignore
//! size: u32
//! _pad: u32
//! values: [u64; size]
//! ```

use super::{
    allocator::PackedAllocator, read_u32, read_u64, write_u32, write_u64, OutOfBlockSpace,
    PackedError, PackedView, SegmentTag, ALIGNMENT,
};

const HEADER_SIZE: usize = 8;

pub fn byte_size(size: usize) -> usize {
    HEADER_SIZE + size * 8
}

#[derive(Clone, Copy)]
pub struct ArrayView<'a> {
    bytes: &'a [u8],
}

impl<'a> PackedView<'a> for ArrayView<'a> {
    const TAG: SegmentTag = SegmentTag::ARRAY;

    fn from_segment(bytes: &'a [u8]) -> Self {
        ArrayView { bytes }
    }
}

impl<'a> ArrayView<'a> {
    pub fn size(&self) -> usize {
        read_u32(self.bytes, 0) as usize
    }

    pub fn get(&self, idx: usize) -> u64 {
        assert!(idx < self.size());
        read_u64(self.bytes, HEADER_SIZE + idx * 8)
    }

    pub fn values(&self, start: usize, end: usize) -> Vec<u64> {
        assert!(start <= end && end <= self.size());
        (start..end).map(|i| self.get(i)).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        (0..self.size()).map(move |i| self.get(i))
    }

    pub fn check(&self) -> Result<(), PackedError> {
        if self.bytes.len() != byte_size(self.size()) {
            return Err(PackedError::InvalidLayout("array length mismatch"));
        }
        Ok(())
    }
}

/// Handle to an array stored in an allocator slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedArray {
    slot: usize,
}

impl PackedArray {
    pub const fn new(slot: usize) -> Self {
        PackedArray { slot }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn view<'a, B: AsRef<[u8]>>(
        &self,
        alloc: &'a PackedAllocator<B>,
    ) -> Result<ArrayView<'a>, PackedError> {
        alloc.get(self.slot)
    }

    fn size<B: AsRef<[u8]>>(&self, alloc: &PackedAllocator<B>) -> usize {
        read_u32(alloc.segment(self.slot), 0) as usize
    }

    pub fn init<B: AsRef<[u8]> + AsMut<[u8]>>(
        &self,
        alloc: &mut PackedAllocator<B>,
    ) -> Result<(), OutOfBlockSpace> {
        alloc.allocate_space(self.slot, HEADER_SIZE, ALIGNMENT, SegmentTag::ARRAY)?;
        write_u32(alloc.segment_mut(self.slot), 0, 0);
        Ok(())
    }

    pub fn insert<B: AsRef<[u8]> + AsMut<[u8]>>(
        &self,
        alloc: &mut PackedAllocator<B>,
        idx: usize,
        values: &[u64],
    ) -> Result<(), OutOfBlockSpace> {
        let size = self.size(alloc);
        assert!(idx <= size);
        if values.is_empty() {
            return Ok(());
        }

        let new_size = size + values.len();
        alloc.resize_segment(self.slot, byte_size(new_size))?;
        let seg = alloc.segment_mut(self.slot);
        seg.copy_within(
            HEADER_SIZE + idx * 8..HEADER_SIZE + size * 8,
            HEADER_SIZE + (idx + values.len()) * 8,
        );
        for (i, value) in values.iter().enumerate() {
            write_u64(seg, HEADER_SIZE + (idx + i) * 8, *value);
        }
        write_u32(seg, 0, new_size as u32);
        Ok(())
    }

    pub fn remove<B: AsRef<[u8]> + AsMut<[u8]>>(
        &self,
        alloc: &mut PackedAllocator<B>,
        start: usize,
        end: usize,
    ) {
        let size = self.size(alloc);
        assert!(start <= end && end <= size);
        if start == end {
            return;
        }

        let seg = alloc.segment_mut(self.slot);
        seg.copy_within(HEADER_SIZE + end * 8..HEADER_SIZE + size * 8, HEADER_SIZE + start * 8);
        let new_size = size - (end - start);
        write_u32(seg, 0, new_size as u32);
        alloc.shrink_segment(self.slot, byte_size(new_size));
    }

    pub fn set<B: AsRef<[u8]> + AsMut<[u8]>>(
        &self,
        alloc: &mut PackedAllocator<B>,
        idx: usize,
        value: u64,
    ) {
        assert!(idx < self.size(alloc));
        write_u64(alloc.segment_mut(self.slot), HEADER_SIZE + idx * 8, value);
    }

    /// Move values `idx..` to the front of `other`. On failure neither array changes.
    pub fn split_to<B, O>(
        &self,
        alloc: &mut PackedAllocator<B>,
        other: &PackedArray,
        other_alloc: &mut PackedAllocator<O>,
        idx: usize,
    ) -> Result<(), OutOfBlockSpace>
    where
        B: AsRef<[u8]> + AsMut<[u8]>,
        O: AsRef<[u8]> + AsMut<[u8]>,
    {
        let size = self.size(alloc);
        let moved = ArrayView::from_segment(alloc.segment(self.slot)).values(idx, size);
        other.insert(other_alloc, 0, &moved)?;
        self.remove(alloc, idx, size);
        Ok(())
    }

    /// Append all values of `other`. On failure this array is unchanged.
    pub fn merge_with<B: AsRef<[u8]> + AsMut<[u8]>>(
        &self,
        alloc: &mut PackedAllocator<B>,
        other: &ArrayView,
    ) -> Result<(), OutOfBlockSpace> {
        let size = self.size(alloc);
        self.insert(alloc, size, &other.values(0, other.size()))
    }
}
