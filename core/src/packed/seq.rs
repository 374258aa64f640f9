//! Searchable symbol sequence with rank and select.
//!
//! ```rust,ignore
//! size: u32
//! bits: u32                          // bits per symbol: 1, 2 or 4
//! symbols: [u64; words]              // LSB-first bit packing, unused tail bits are zero
//! index: see `index.rs`, one column per symbol, over groups of SYMBOLS_PER_GROUP
//! ```
//!
//! A sequence with one bit per symbol is a bitmap.

use bitvec::prelude::*;

use super::{
    allocator::PackedAllocator,
    index::{self, IndexLayout, IndexView, SearchType},
    read_u32, write_u32, OutOfBlockSpace, PackedError, PackedView, SegmentTag, ALIGNMENT,
};

const HEADER_SIZE: usize = 8;

/// Symbols summarized by one level-0 index entry.
pub const SYMBOLS_PER_GROUP: usize = 256;

fn words(size: usize, bits: usize) -> usize {
    (size * bits + 63) / 64
}

fn index_layout(size: usize, bits: usize) -> IndexLayout {
    IndexLayout::new((size + SYMBOLS_PER_GROUP - 1) / SYMBOLS_PER_GROUP, 1 << bits)
}

pub fn byte_size(size: usize, bits: usize) -> usize {
    HEADER_SIZE + words(size, bits) * 8 + index_layout(size, bits).byte_size()
}

#[derive(Clone, Copy)]
pub struct SeqView<'a> {
    bytes: &'a [u8],
}

impl<'a> PackedView<'a> for SeqView<'a> {
    const TAG: SegmentTag = SegmentTag::SEQ;

    fn from_segment(bytes: &'a [u8]) -> Self {
        SeqView { bytes }
    }
}

impl<'a> SeqView<'a> {
    pub fn size(&self) -> usize {
        read_u32(self.bytes, 0) as usize
    }

    pub fn bits(&self) -> usize {
        read_u32(self.bytes, 4) as usize
    }

    pub fn alphabet(&self) -> usize {
        1 << self.bits()
    }

    fn symbol_bits(&self) -> &'a BitSlice<u8, Lsb0> {
        let len = words(self.size(), self.bits()) * 8;
        self.bytes[HEADER_SIZE..HEADER_SIZE + len].view_bits::<Lsb0>()
    }

    fn index(&self) -> IndexView<'a> {
        let size = self.size();
        let bits = self.bits();
        IndexView::new(
            index_layout(size, bits),
            &self.bytes[HEADER_SIZE + words(size, bits) * 8..],
        )
    }

    pub fn symbol(&self, idx: usize) -> u8 {
        assert!(idx < self.size());
        let bits = self.bits();
        self.symbol_bits()[idx * bits..(idx + 1) * bits].load_le::<u8>()
    }

    pub fn symbols(&self, start: usize, end: usize) -> Vec<u8> {
        assert!(start <= end && end <= self.size());
        (start..end).map(|i| self.symbol(i)).collect()
    }

    // occurrences of `symbol` in `start..end`, scanning the packed bits.
    fn count_range(&self, symbol: u8, start: usize, end: usize) -> u64 {
        let bits = self.bits();
        if bits == 1 {
            let ones = self.symbol_bits()[start..end].count_ones() as u64;
            return if symbol == 1 {
                ones
            } else {
                (end - start) as u64 - ones
            };
        }
        (start..end).filter(|i| self.symbol(*i) == symbol).count() as u64
    }

    /// Occurrences of `symbol` before `idx`.
    pub fn rank(&self, idx: usize, symbol: u8) -> usize {
        assert!(idx <= self.size());
        assert!((symbol as usize) < self.alphabet());
        let index = self.index();
        if index.layout().is_empty() {
            return self.count_range(symbol, 0, idx) as usize;
        }
        let group = idx / SYMBOLS_PER_GROUP;
        let base = index.prefix(symbol as usize, group);
        (base + self.count_range(symbol, group * SYMBOLS_PER_GROUP, idx)) as usize
    }

    /// Position of the occurrence of `symbol` preceded by exactly `nth` others.
    pub fn select(&self, symbol: u8, nth: usize) -> Option<usize> {
        assert!((symbol as usize) < self.alphabet());
        let target = nth as u64 + 1;
        let (group, mut seen) = self.index().descend(symbol as usize, target, SearchType::GE)?;
        let start = group * SYMBOLS_PER_GROUP;
        let end = (start + SYMBOLS_PER_GROUP).min(self.size());
        for i in start..end {
            if self.symbol(i) == symbol {
                seen += 1;
                if seen == target {
                    return Some(i);
                }
            }
        }
        None
    }

    pub fn count(&self, symbol: u8) -> usize {
        self.rank(self.size(), symbol)
    }

    pub fn check(&self, slot: usize) -> Result<(), PackedError> {
        if self.bytes.len() != byte_size(self.size(), self.bits()) {
            return Err(PackedError::InvalidLayout("sequence length mismatch"));
        }
        let size = self.size();
        index::check(&self.index(), slot, |group, column| {
            let start = group * SYMBOLS_PER_GROUP;
            let end = (start + SYMBOLS_PER_GROUP).min(size);
            self.count_range(column as u8, start, end)
        })
    }
}

/// Handle to a symbol sequence stored in an allocator slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedSeq {
    slot: usize,
}

impl PackedSeq {
    pub const fn new(slot: usize) -> Self {
        PackedSeq { slot }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn view<'a, B: AsRef<[u8]>>(
        &self,
        alloc: &'a PackedAllocator<B>,
    ) -> Result<SeqView<'a>, PackedError> {
        alloc.get(self.slot)
    }

    fn raw<'a, B: AsRef<[u8]>>(&self, alloc: &'a PackedAllocator<B>) -> SeqView<'a> {
        debug_assert_eq!(alloc.segment_header(self.slot).tag, SegmentTag::SEQ);
        SeqView::from_segment(alloc.segment(self.slot))
    }

    /// Allocate an empty sequence with `bits` bits per symbol.
    pub fn init<B: AsRef<[u8]> + AsMut<[u8]>>(
        &self,
        alloc: &mut PackedAllocator<B>,
        bits: usize,
    ) -> Result<(), OutOfBlockSpace> {
        assert!(matches!(bits, 1 | 2 | 4), "unsupported symbol width {bits}");
        alloc.allocate_space(self.slot, HEADER_SIZE, ALIGNMENT, SegmentTag::SEQ)?;
        let seg = alloc.segment_mut(self.slot);
        write_u32(seg, 0, 0);
        write_u32(seg, 4, bits as u32);
        Ok(())
    }

    pub fn insert<B: AsRef<[u8]> + AsMut<[u8]>>(
        &self,
        alloc: &mut PackedAllocator<B>,
        idx: usize,
        symbols: &[u8],
    ) -> Result<(), OutOfBlockSpace> {
        let view = self.raw(alloc);
        let size = view.size();
        let bits = view.bits();
        assert!(idx <= size);
        assert!(symbols.iter().all(|s| (*s as usize) < (1 << bits)));
        if symbols.is_empty() {
            return Ok(());
        }

        let new_size = size + symbols.len();
        alloc.resize_segment(self.slot, byte_size(new_size, bits))?;
        let seg = alloc.segment_mut(self.slot);
        let region =
            seg[HEADER_SIZE..HEADER_SIZE + words(new_size, bits) * 8].view_bits_mut::<Lsb0>();
        // bitvec rejects a destination at the end of the slice, even for an empty source.
        if idx < size {
            region.copy_within(idx * bits..size * bits, (idx + symbols.len()) * bits);
        }
        for (i, symbol) in symbols.iter().enumerate() {
            let at = (idx + i) * bits;
            region[at..at + bits].store_le::<u8>(*symbol);
        }
        // the grown region may cover stale index bytes.
        region[new_size * bits..].fill(false);
        write_u32(seg, 0, new_size as u32);
        reindex_segment(seg);
        Ok(())
    }

    pub fn remove<B: AsRef<[u8]> + AsMut<[u8]>>(
        &self,
        alloc: &mut PackedAllocator<B>,
        start: usize,
        end: usize,
    ) {
        let view = self.raw(alloc);
        let size = view.size();
        let bits = view.bits();
        assert!(start <= end && end <= size);
        if start == end {
            return;
        }

        let new_size = size - (end - start);
        let seg = alloc.segment_mut(self.slot);
        let region = seg[HEADER_SIZE..HEADER_SIZE + words(size, bits) * 8].view_bits_mut::<Lsb0>();
        region.copy_within(end * bits..size * bits, start * bits);
        region[new_size * bits..].fill(false);
        write_u32(seg, 0, new_size as u32);
        reindex_segment(seg);
        alloc.shrink_segment(self.slot, byte_size(new_size, bits));
    }

    pub fn set<B: AsRef<[u8]> + AsMut<[u8]>>(
        &self,
        alloc: &mut PackedAllocator<B>,
        idx: usize,
        symbol: u8,
    ) {
        let view = self.raw(alloc);
        let size = view.size();
        let bits = view.bits();
        assert!(idx < size && (symbol as usize) < (1 << bits));
        let seg = alloc.segment_mut(self.slot);
        let region = seg[HEADER_SIZE..HEADER_SIZE + words(size, bits) * 8].view_bits_mut::<Lsb0>();
        region[idx * bits..(idx + 1) * bits].store_le::<u8>(symbol);
        reindex_segment(seg);
    }

    /// Move symbols `idx..` to the front of `other`. On failure neither sequence changes.
    pub fn split_to<B, O>(
        &self,
        alloc: &mut PackedAllocator<B>,
        other: &PackedSeq,
        other_alloc: &mut PackedAllocator<O>,
        idx: usize,
    ) -> Result<(), OutOfBlockSpace>
    where
        B: AsRef<[u8]> + AsMut<[u8]>,
        O: AsRef<[u8]> + AsMut<[u8]>,
    {
        let view = self.raw(alloc);
        let size = view.size();
        assert_eq!(view.bits(), other.raw(other_alloc).bits());
        let moved = view.symbols(idx, size);
        other.insert(other_alloc, 0, &moved)?;
        self.remove(alloc, idx, size);
        Ok(())
    }

    /// Append all symbols of `other`. On failure this sequence is unchanged.
    pub fn merge_with<B: AsRef<[u8]> + AsMut<[u8]>>(
        &self,
        alloc: &mut PackedAllocator<B>,
        other: &SeqView,
    ) -> Result<(), OutOfBlockSpace> {
        let size = self.raw(alloc).size();
        self.insert(alloc, size, &other.symbols(0, other.size()))
    }

    pub fn reindex<B: AsRef<[u8]> + AsMut<[u8]>>(&self, alloc: &mut PackedAllocator<B>) {
        reindex_segment(alloc.segment_mut(self.slot));
    }
}

fn reindex_segment(seg: &mut [u8]) {
    let size = read_u32(seg, 0) as usize;
    let bits = read_u32(seg, 4) as usize;
    let layout = index_layout(size, bits);
    if layout.is_empty() {
        return;
    }
    let (head, index_bytes) = seg.split_at_mut(HEADER_SIZE + words(size, bits) * 8);
    let region = head[HEADER_SIZE..].view_bits::<Lsb0>();
    index::rebuild(&layout, index_bytes, |group, symbol| {
        let start = group * SYMBOLS_PER_GROUP;
        let end = (start + SYMBOLS_PER_GROUP).min(size);
        (start..end)
            .filter(|i| region[i * bits..(i + 1) * bits].load_le::<u8>() as usize == symbol)
            .count() as u64
    });
}
