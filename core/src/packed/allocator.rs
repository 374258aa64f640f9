//! The packed allocator divides one fixed-size buffer into numbered segments.
//!
//! Here is the layout of the buffer:
//!
//! ```rust,ignore
//! block_size: u32           // bytes managed, including this header
//! segments: u32             // number of slots
//! layout: [SegmentHeader; segments]
//!     offset: u32           // payload start, relative to the buffer start
//!     length: u32           // payload length in bytes
//!     tag: u64              // type code of the payload
//! areas: [Area; segments]
//!     tag_area: [u8; 8]     // encoded tag, right-aligned against the payload
//!     payload: [u8; round_up(length, 8)]
//! free: [u8]
//! ```
//!
//! Areas are contiguous and in slot order. Resizing a segment shifts every following area,
//! and fails with [`OutOfBlockSpace`] once the free tail is exhausted. The buffer itself never
//! grows.
//!
//! The tag is recorded twice: in the structured header, which is what lookups use, and in
//! the bytes right before the payload, which is what an untyped scan of raw block bytes
//! relies on. The two must agree.

use std::ops::Range;

use super::{
    read_u32, read_u64, round_up, tag::SegmentTag, write_u32, write_u64, OutOfBlockSpace,
    PackedError, PackedView, ALIGNMENT,
};

/// Size of the fixed allocator header.
pub const ALLOCATOR_HEADER_SIZE: usize = 8;
/// Size of one entry of the segment layout table.
pub const SEGMENT_HEADER_SIZE: usize = 16;
/// Bytes reserved in front of every payload for its tag.
pub const TAG_AREA_SIZE: usize = 8;

/// One entry of the segment layout table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Payload start, relative to the buffer start. Always 8-aligned.
    pub offset: usize,
    /// Payload length in bytes.
    pub length: usize,
    /// Type of the payload.
    pub tag: SegmentTag,
}

impl SegmentHeader {
    fn area_end(&self) -> usize {
        self.offset + round_up(self.length)
    }
}

/// An allocator over a byte buffer.
///
/// `B` is `&[u8]` for read-only access, `&mut [u8]` or `Vec<u8>` for mutation.
pub struct PackedAllocator<B> {
    buf: B,
}

/// Bytes needed by an allocator with `segments` empty slots.
pub fn empty_size(segments: usize) -> usize {
    data_start(segments) + segments * TAG_AREA_SIZE
}

fn data_start(segments: usize) -> usize {
    round_up(ALLOCATOR_HEADER_SIZE + segments * SEGMENT_HEADER_SIZE)
}

fn header_offset(slot: usize) -> usize {
    ALLOCATOR_HEADER_SIZE + slot * SEGMENT_HEADER_SIZE
}

impl<B: AsRef<[u8]>> PackedAllocator<B> {
    /// Open an allocator previously laid out by [`PackedAllocator::init`].
    pub fn open(buf: B) -> Result<Self, PackedError> {
        let bytes = buf.as_ref();
        if bytes.len() < ALLOCATOR_HEADER_SIZE {
            return Err(PackedError::InvalidLayout("buffer shorter than header"));
        }
        let block_size = read_u32(bytes, 0) as usize;
        let segments = read_u32(bytes, 4) as usize;
        if block_size != bytes.len() {
            return Err(PackedError::InvalidLayout("block size does not match buffer"));
        }
        if empty_size(segments) > block_size {
            return Err(PackedError::InvalidLayout("segment table exceeds block"));
        }

        let alloc = PackedAllocator { buf };
        let mut expected = data_start(segments) + TAG_AREA_SIZE;
        for slot in 0..segments {
            let header = alloc.segment_header(slot);
            if header.offset != expected || header.area_end() > block_size {
                return Err(PackedError::InvalidLayout("segments are not contiguous"));
            }
            expected = header.area_end() + TAG_AREA_SIZE;
        }
        Ok(alloc)
    }

    /// Total bytes managed by this allocator.
    pub fn block_size(&self) -> usize {
        read_u32(self.buf.as_ref(), 0) as usize
    }

    /// Number of segment slots.
    pub fn segments(&self) -> usize {
        read_u32(self.buf.as_ref(), 4) as usize
    }

    pub fn segment_header(&self, slot: usize) -> SegmentHeader {
        assert!(slot < self.segments(), "segment slot {slot} out of range");
        let buf = self.buf.as_ref();
        let at = header_offset(slot);
        SegmentHeader {
            offset: read_u32(buf, at) as usize,
            length: read_u32(buf, at + 4) as usize,
            tag: SegmentTag::new(read_u64(buf, at + 8)),
        }
    }

    /// The payload of a segment.
    pub fn segment(&self, slot: usize) -> &[u8] {
        let header = self.segment_header(slot);
        &self.buf.as_ref()[header.offset..header.offset + header.length]
    }

    /// End of the last area: everything past it is free.
    pub fn allocated(&self) -> usize {
        let segments = self.segments();
        if segments == 0 {
            return data_start(0);
        }
        self.segment_header(segments - 1).area_end()
    }

    pub fn free_space(&self) -> usize {
        self.block_size() - self.allocated()
    }

    /// Read the tag of a segment from the bytes preceding its payload and check it against
    /// the segment header.
    pub fn tag(&self, slot: usize) -> Result<SegmentTag, PackedError> {
        let header = self.segment_header(slot);
        let stored = SegmentTag::read_before(self.buf.as_ref(), header.offset)
            .ok_or(PackedError::CorruptedTag { slot })?;
        if stored != header.tag {
            return Err(PackedError::TagConflict {
                slot,
                header: header.tag.code(),
                stored: stored.code(),
            });
        }
        Ok(stored)
    }

    /// Get a typed view of a segment.
    pub fn get<'a, T: PackedView<'a>>(&'a self, slot: usize) -> Result<T, PackedError> {
        let tag = self.tag(slot)?;
        if tag != T::TAG {
            return Err(PackedError::TagMismatch {
                slot,
                expected: T::TAG.code(),
                found: tag.code(),
            });
        }
        Ok(T::from_segment(self.segment(slot)))
    }

    /// Walk all segments without knowing their types, recovering each tag from the payload
    /// prefix.
    pub fn scan(
        &self,
    ) -> impl Iterator<Item = Result<(usize, SegmentTag, Range<usize>), PackedError>> + '_ {
        (0..self.segments()).map(move |slot| {
            let header = self.segment_header(slot);
            let tag = SegmentTag::read_before(self.buf.as_ref(), header.offset)
                .ok_or(PackedError::CorruptedTag { slot })?;
            Ok((slot, tag, header.offset..header.offset + header.length))
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.buf.as_ref()
    }

    /// Borrow a read-only allocator over the same bytes.
    pub fn reborrow(&self) -> PackedAllocator<&[u8]> {
        PackedAllocator {
            buf: self.buf.as_ref(),
        }
    }
}

impl<'a> PackedAllocator<&'a [u8]> {
    /// The payload of a segment, borrowed from the buffer rather than from this handle.
    pub fn segment_ref(&self, slot: usize) -> &'a [u8] {
        let header = self.segment_header(slot);
        let buf: &'a [u8] = self.buf;
        &buf[header.offset..header.offset + header.length]
    }

    /// Like [`PackedAllocator::get`], with the view borrowing the buffer.
    pub fn get_ref<T: PackedView<'a>>(&self, slot: usize) -> Result<T, PackedError> {
        let tag = self.tag(slot)?;
        if tag != T::TAG {
            return Err(PackedError::TagMismatch {
                slot,
                expected: T::TAG.code(),
                found: tag.code(),
            });
        }
        Ok(T::from_segment(self.segment_ref(slot)))
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> PackedAllocator<B> {
    /// Lay out an allocator with `segments` empty slots over the whole buffer.
    pub fn init(mut buf: B, segments: usize) -> Result<Self, OutOfBlockSpace> {
        let block_size = buf.as_ref().len();
        let needed = empty_size(segments);
        if needed > block_size || block_size > u32::MAX as usize {
            return Err(OutOfBlockSpace {
                requested: needed,
                available: block_size,
            });
        }

        let bytes = buf.as_mut();
        bytes.fill(0);
        write_u32(bytes, 0, block_size as u32);
        write_u32(bytes, 4, segments as u32);

        let mut alloc = PackedAllocator { buf };
        let mut offset = data_start(segments) + TAG_AREA_SIZE;
        for slot in 0..segments {
            alloc.write_header(
                slot,
                SegmentHeader {
                    offset,
                    length: 0,
                    tag: SegmentTag::EMPTY,
                },
            );
            offset += TAG_AREA_SIZE;
        }
        Ok(alloc)
    }

    /// Give an empty slot `size` bytes and stamp it with `tag`.
    ///
    /// `alignment` must be a power of two no larger than [`ALIGNMENT`]; every payload is
    /// placed at an 8-byte boundary so smaller alignments are satisfied as well. The tag
    /// length is derived from the tag value. Returns the payload offset.
    pub fn allocate_space(
        &mut self,
        slot: usize,
        size: usize,
        alignment: usize,
        tag: SegmentTag,
    ) -> Result<usize, OutOfBlockSpace> {
        assert!(alignment.is_power_of_two() && alignment <= ALIGNMENT);
        assert!(tag.encoded_len() <= TAG_AREA_SIZE);
        let header = self.segment_header(slot);
        assert!(
            header.tag == SegmentTag::EMPTY && header.length == 0,
            "segment {slot} is already allocated"
        );

        let offset = self.resize_segment(slot, size)?;
        self.set_tag(slot, tag);
        Ok(offset)
    }

    /// Release a segment, leaving the slot empty.
    pub fn free(&mut self, slot: usize) {
        self.shrink_segment(slot, 0);
        self.set_tag(slot, SegmentTag::EMPTY);
    }

    /// Grow or shrink a segment, shifting the areas that follow it.
    ///
    /// Existing payload bytes up to the new length are preserved. Grown bytes are zeroed.
    pub fn resize_segment(
        &mut self,
        slot: usize,
        new_size: usize,
    ) -> Result<usize, OutOfBlockSpace> {
        let header = self.segment_header(slot);
        if new_size <= header.length {
            return Ok(self.shrink_segment(slot, new_size));
        }

        let old_area = round_up(header.length);
        let new_area = round_up(new_size);
        if new_area > old_area {
            let delta = new_area - old_area;
            let allocated = self.allocated();
            let available = self.block_size() - allocated;
            if delta > available {
                return Err(OutOfBlockSpace {
                    requested: delta,
                    available,
                });
            }
            let old_end = header.offset + old_area;
            let bytes = self.buf.as_mut();
            bytes.copy_within(old_end..allocated, old_end + delta);
            bytes[old_end..old_end + delta].fill(0);
            self.shift_following(slot, delta as isize);
        }

        self.write_header(
            slot,
            SegmentHeader {
                length: new_size,
                ..header
            },
        );
        Ok(header.offset)
    }

    /// Shrink a segment. Never fails.
    ///
    /// Panics if `new_size` exceeds the current length.
    pub fn shrink_segment(&mut self, slot: usize, new_size: usize) -> usize {
        let header = self.segment_header(slot);
        assert!(new_size <= header.length);

        let old_area = round_up(header.length);
        let new_area = round_up(new_size);
        if new_area < old_area {
            let delta = old_area - new_area;
            let allocated = self.allocated();
            let old_end = header.offset + old_area;
            let bytes = self.buf.as_mut();
            bytes.copy_within(old_end..allocated, old_end - delta);
            bytes[allocated - delta..allocated].fill(0);
            self.shift_following(slot, -(delta as isize));
        }

        // bytes between the payload length and the area end stay zero.
        let bytes = self.buf.as_mut();
        bytes[header.offset + new_size..header.offset + new_area].fill(0);

        self.write_header(
            slot,
            SegmentHeader {
                length: new_size,
                ..header
            },
        );
        header.offset
    }

    pub fn segment_mut(&mut self, slot: usize) -> &mut [u8] {
        let header = self.segment_header(slot);
        &mut self.buf.as_mut()[header.offset..header.offset + header.length]
    }

    /// Copy the complete state of another allocator of the same size into this one.
    pub fn copy_from(&mut self, other: &PackedAllocator<impl AsRef<[u8]>>) {
        self.buf.as_mut().copy_from_slice(other.as_bytes());
    }

    fn set_tag(&mut self, slot: usize, tag: SegmentTag) {
        let header = self.segment_header(slot);
        let bytes = self.buf.as_mut();
        bytes[header.offset - TAG_AREA_SIZE..header.offset].fill(0);
        tag.write_before(bytes, header.offset);
        self.write_header(slot, SegmentHeader { tag, ..header });
    }

    fn shift_following(&mut self, slot: usize, delta: isize) {
        for next in slot + 1..self.segments() {
            let header = self.segment_header(next);
            let offset = (header.offset as isize + delta) as usize;
            self.write_header(next, SegmentHeader { offset, ..header });
        }
    }

    fn write_header(&mut self, slot: usize, header: SegmentHeader) {
        let at = header_offset(slot);
        let bytes = self.buf.as_mut();
        write_u32(bytes, at, header.offset as u32);
        write_u32(bytes, at + 4, header.length as u32);
        write_u64(bytes, at + 8, header.tag.code());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alloc(size: usize, segments: usize) -> PackedAllocator<Vec<u8>> {
        PackedAllocator::init(vec![0; size], segments).unwrap()
    }

    #[test]
    fn init_lays_out_empty_slots() {
        let a = alloc(256, 3);
        assert_eq!(a.segments(), 3);
        assert_eq!(a.block_size(), 256);
        for slot in 0..3 {
            assert_eq!(a.segment(slot).len(), 0);
            assert_eq!(a.tag(slot).unwrap(), SegmentTag::EMPTY);
            assert_eq!(a.segment_header(slot).offset % ALIGNMENT, 0);
        }
        assert_eq!(a.allocated(), empty_size(3));
        assert!(PackedAllocator::open(a.as_bytes()).is_ok());
    }

    #[test]
    fn too_small_buffer() {
        let err = PackedAllocator::init(vec![0; 16], 4).err().unwrap();
        assert_eq!(err.available, 16);
    }

    #[test]
    fn resize_moves_following_segments() {
        let mut a = alloc(512, 3);
        a.allocate_space(0, 10, 8, SegmentTag::SUM_TREE).unwrap();
        a.allocate_space(1, 4, 4, SegmentTag::ARRAY).unwrap();
        a.allocate_space(2, 16, 1, SegmentTag::SEQ).unwrap();
        a.segment_mut(1).copy_from_slice(&[1, 2, 3, 4]);
        a.segment_mut(2).fill(9);

        let before = a.segment_header(2).offset;
        a.resize_segment(0, 40).unwrap();
        assert_eq!(a.segment_header(2).offset, before + 32);
        assert_eq!(a.segment(1), &[1, 2, 3, 4]);
        assert!(a.segment(2).iter().all(|b| *b == 9));
        assert_eq!(a.tag(1).unwrap(), SegmentTag::ARRAY);
        assert_eq!(a.tag(2).unwrap(), SegmentTag::SEQ);

        a.resize_segment(0, 0).unwrap();
        assert_eq!(a.segment_header(2).offset, before - 16);
        assert_eq!(a.segment(1), &[1, 2, 3, 4]);
        assert!(PackedAllocator::open(a.as_bytes()).is_ok());
    }

    #[test]
    fn growth_past_capacity_fails_without_change() {
        let mut a = alloc(128, 2);
        a.allocate_space(0, 8, 8, SegmentTag::ARRAY).unwrap();
        let snapshot = a.as_bytes().to_vec();
        let free = a.free_space();

        let err = a.resize_segment(0, 8 + free + 1).err().unwrap();
        assert_eq!(err.available, free);
        assert_eq!(a.as_bytes(), &snapshot[..]);

        // exactly filling the block works.
        a.resize_segment(0, 8 + free).unwrap();
        assert_eq!(a.free_space(), 0);
    }

    #[test]
    fn typed_access_checks_tag() {
        let mut a = alloc(256, 2);
        crate::packed::PackedArray::new(0).init(&mut a).unwrap();
        assert!(a.get::<crate::packed::ArrayView>(0).is_ok());
        assert_eq!(
            a.get::<crate::packed::SumTreeView>(0).err(),
            Some(PackedError::TagMismatch {
                slot: 0,
                expected: SegmentTag::SUM_TREE.code(),
                found: SegmentTag::ARRAY.code(),
            })
        );

        let bytes = a.as_bytes().to_vec();
        let view = {
            let handle = PackedAllocator::open(&bytes[..]).unwrap();
            handle.get_ref::<crate::packed::ArrayView>(0).unwrap()
        };
        assert_eq!(view.size(), 0);
    }

    #[test]
    fn scan_recovers_tags_from_bytes() {
        let mut a = alloc(256, 3);
        a.allocate_space(0, 8, 8, SegmentTag::SEQ).unwrap();
        a.allocate_space(2, 3, 1, SegmentTag::new(0xABCDEF)).unwrap();
        let tags = a
            .scan()
            .map(|r| r.map(|(_, tag, _)| tag))
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(tags, vec![SegmentTag::SEQ, SegmentTag::EMPTY, SegmentTag::new(0xABCDEF)]);
    }

    #[test]
    fn corrupted_tag_is_detected() {
        let mut a = alloc(256, 1);
        a.allocate_space(0, 8, 8, SegmentTag::SEQ).unwrap();
        let offset = a.segment_header(0).offset;
        let mut bytes = a.as_bytes().to_vec();
        bytes[offset - 1] = (SegmentTag::SUM_TREE.code() << 3) as u8;

        let reopened = PackedAllocator::open(&bytes[..]).unwrap();
        assert!(matches!(reopened.tag(0), Err(PackedError::TagConflict { slot: 0, .. })));

        bytes[offset - 1] = 0b111;
        let reopened = PackedAllocator::open(&bytes[..]).unwrap();
        assert_eq!(reopened.tag(0), Err(PackedError::CorruptedTag { slot: 0 }));
    }

    #[test]
    fn free_empties_slot() {
        let mut a = alloc(256, 2);
        a.allocate_space(0, 24, 8, SegmentTag::ARRAY).unwrap();
        a.allocate_space(1, 8, 8, SegmentTag::SEQ).unwrap();
        a.free(0);
        assert_eq!(a.segment(0).len(), 0);
        assert_eq!(a.tag(0).unwrap(), SegmentTag::EMPTY);
        assert_eq!(a.tag(1).unwrap(), SegmentTag::SEQ);
        a.allocate_space(0, 8, 8, SegmentTag::SUM_TREE).unwrap();
    }
}
