//! Multi-level sum index shared by the indexed structures.
//!
//! Values are grouped into runs of a structure-defined group size. Level 0 holds one entry
//! per group, with one `u64` sum per column. Each higher level holds one entry per
//! [`BRANCHING_FACTOR`] entries of the level below, up to a top level of exactly one entry.
//! A structure with a single group has no index at all and is scanned directly.
//!
//! Layout in bytes, levels stored bottom-up:
//!
//! ```rust,ignore
//! level_0: [[u64; columns]; groups]
//! level_1: [[u64; columns]; ceil(groups / BRANCHING_FACTOR)]
//! ...
//! top:     [[u64; columns]; 1]
//! ```
//!
//! The index is never patched in place: [`rebuild`] recomputes it bottom-up after each raw
//! mutation.

use arrayvec::ArrayVec;

use super::{read_u64, write_u64, PackedError};

/// Values per group in the sum tree.
pub const VALUES_PER_BRANCH: usize = 32;
/// Index entries summarized by one entry of the level above.
pub const BRANCHING_FACTOR: usize = 32;
/// Enough levels for any group count addressable by a `u32`.
pub const MAX_INDEX_LEVELS: usize = 8;

/// How a search compares the running sum against its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchType {
    /// Stop at the first element where the running sum exceeds the target.
    GT,
    /// Stop at the first element where the running sum reaches the target.
    GE,
}

impl SearchType {
    pub fn satisfied(self, sum: u64, target: u64) -> bool {
        match self {
            SearchType::GT => sum > target,
            SearchType::GE => sum >= target,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Level {
    start: usize,
    len: usize,
}

/// Shape of an index over a given number of groups.
#[derive(Debug, Clone)]
pub struct IndexLayout {
    columns: usize,
    levels: ArrayVec<Level, MAX_INDEX_LEVELS>,
}

impl IndexLayout {
    pub fn new(groups: usize, columns: usize) -> Self {
        let mut levels = ArrayVec::new();
        if groups > 1 {
            let mut start = 0;
            let mut len = groups;
            loop {
                levels.push(Level { start, len });
                if len == 1 {
                    break;
                }
                start += len;
                len = (len + BRANCHING_FACTOR - 1) / BRANCHING_FACTOR;
            }
        }
        IndexLayout { columns, levels }
    }

    /// Total number of entries over all levels.
    pub fn entries(&self) -> usize {
        self.levels.last().map_or(0, |l| l.start + l.len)
    }

    pub fn byte_size(&self) -> usize {
        self.entries() * self.columns * 8
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    fn entry_offset(&self, level: usize, i: usize, column: usize) -> usize {
        ((self.levels[level].start + i) * self.columns + column) * 8
    }
}

/// Read access to an index.
pub struct IndexView<'a> {
    layout: IndexLayout,
    bytes: &'a [u8],
}

impl<'a> IndexView<'a> {
    pub fn new(layout: IndexLayout, bytes: &'a [u8]) -> Self {
        debug_assert!(bytes.len() >= layout.byte_size());
        IndexView { layout, bytes }
    }

    pub fn layout(&self) -> &IndexLayout {
        &self.layout
    }

    pub fn entry(&self, level: usize, i: usize, column: usize) -> u64 {
        read_u64(self.bytes, self.layout.entry_offset(level, i, column))
    }

    /// Sum of the first `groups` groups in `column`.
    ///
    /// Must not be called on an empty index.
    pub fn prefix(&self, column: usize, groups: usize) -> u64 {
        let mut sum = 0;
        let mut level = 0;
        let mut count = groups;
        while count > 0 {
            let full = count / BRANCHING_FACTOR;
            for i in full * BRANCHING_FACTOR..count {
                sum += self.entry(level, i, column);
            }
            level += 1;
            if level == self.layout.depth() {
                break;
            }
            count = full;
        }
        sum
    }

    /// Find the first group at which the running sum of `column` satisfies the search.
    ///
    /// Returns the group and the sum of all groups before it, or `None` if even the total
    /// does not satisfy the search. An empty index yields group 0: the caller scans it.
    pub fn descend(&self, column: usize, target: u64, search: SearchType) -> Option<(usize, u64)> {
        let depth = self.layout.depth();
        if depth == 0 {
            return Some((0, 0));
        }

        let top = depth - 1;
        if !search.satisfied(self.entry(top, 0, column), target) {
            return None;
        }

        let mut node = 0;
        let mut prefix = 0;
        for level in (0..top).rev() {
            let start = node * BRANCHING_FACTOR;
            let end = (start + BRANCHING_FACTOR).min(self.layout.levels[level].len);
            let mut found = None;
            for i in start..end {
                let entry = self.entry(level, i, column);
                if search.satisfied(prefix + entry, target) {
                    found = Some(i);
                    break;
                }
                prefix += entry;
            }
            // the parent entry satisfied the search and equals the sum of these children.
            node = found?;
        }
        Some((node, prefix))
    }
}

/// Recompute an index bottom-up.
///
/// `group_sum(group, column)` yields the sum of one group of values.
pub fn rebuild(
    layout: &IndexLayout,
    bytes: &mut [u8],
    mut group_sum: impl FnMut(usize, usize) -> u64,
) {
    let columns = layout.columns;
    for (level_idx, level) in layout.levels.iter().enumerate() {
        for i in 0..level.len {
            for column in 0..columns {
                let sum = if level_idx == 0 {
                    group_sum(i, column)
                } else {
                    let below = layout.levels[level_idx - 1];
                    let start = i * BRANCHING_FACTOR;
                    let end = (start + BRANCHING_FACTOR).min(below.len);
                    let mut sum = 0;
                    for child in start..end {
                        sum += read_u64(bytes, layout.entry_offset(level_idx - 1, child, column));
                    }
                    sum
                };
                write_u64(bytes, layout.entry_offset(level_idx, i, column), sum);
            }
        }
    }
}

/// Compare an index against freshly computed group sums.
pub fn check(
    view: &IndexView,
    slot: usize,
    mut group_sum: impl FnMut(usize, usize) -> u64,
) -> Result<(), PackedError> {
    let layout = view.layout();
    for (level_idx, level) in layout.levels.iter().enumerate() {
        for i in 0..level.len {
            for column in 0..layout.columns {
                let expected = if level_idx == 0 {
                    group_sum(i, column)
                } else {
                    let below = layout.levels[level_idx - 1];
                    let start = i * BRANCHING_FACTOR;
                    let end = (start + BRANCHING_FACTOR).min(below.len);
                    (start..end)
                        .map(|child| view.entry(level_idx - 1, child, column))
                        .sum()
                };
                if view.entry(level_idx, i, column) != expected {
                    return Err(PackedError::IndexDrift {
                        slot,
                        level: level_idx,
                        entry: i,
                    });
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(groups: &[u64]) -> (IndexLayout, Vec<u8>) {
        let layout = IndexLayout::new(groups.len(), 1);
        let mut bytes = vec![0; layout.byte_size()];
        rebuild(&layout, &mut bytes, |g, _| groups[g]);
        (layout, bytes)
    }

    #[test]
    fn level_shapes() {
        assert!(IndexLayout::new(0, 1).is_empty());
        assert!(IndexLayout::new(1, 1).is_empty());
        assert_eq!(IndexLayout::new(2, 1).entries(), 3);
        assert_eq!(IndexLayout::new(32, 2).entries(), 33);
        // 33 groups -> 2 level-1 entries -> 1 top.
        let layout = IndexLayout::new(33, 1);
        assert_eq!(layout.depth(), 3);
        assert_eq!(layout.entries(), 36);
        assert_eq!(layout.byte_size(), 36 * 8);
    }

    #[test]
    fn prefix_matches_linear_sum() {
        let groups: Vec<u64> = (0..1500).map(|i| (i * 7 % 13) as u64).collect();
        let (layout, bytes) = build(&groups);
        let view = IndexView::new(layout, &bytes);
        for count in [0, 1, 31, 32, 33, 1023, 1024, 1025, 1499, 1500] {
            assert_eq!(view.prefix(0, count), groups[..count].iter().sum::<u64>(), "{count}");
        }
    }

    #[test]
    fn descend_finds_first_satisfying_group() {
        let groups: Vec<u64> = (0..100).map(|i| if i % 3 == 0 { 0 } else { 2 }).collect();
        let (layout, bytes) = build(&groups);
        let view = IndexView::new(layout, &bytes);
        let total: u64 = groups.iter().sum();

        assert_eq!(view.descend(0, 0, SearchType::GE), Some((0, 0)));
        // group 0 is zero, group 1 holds 2.
        assert_eq!(view.descend(0, 0, SearchType::GT), Some((1, 0)));
        assert_eq!(view.descend(0, 2, SearchType::GE), Some((1, 0)));
        assert_eq!(view.descend(0, 2, SearchType::GT), Some((2, 2)));
        assert_eq!(view.descend(0, total, SearchType::GE), Some((98, total - 2)));
        assert_eq!(view.descend(0, total, SearchType::GT), None);
    }

    #[test]
    fn drift_is_reported() {
        let groups: Vec<u64> = (0..40).collect();
        let (layout, mut bytes) = build(&groups);
        assert!(check(&IndexView::new(layout.clone(), &bytes), 0, |g, _| groups[g]).is_ok());
        write_u64(&mut bytes, layout.entry_offset(1, 0, 0), 1);
        assert_eq!(
            check(&IndexView::new(layout, &bytes), 3, |g, _| groups[g]),
            Err(PackedError::IndexDrift {
                slot: 3,
                level: 1,
                entry: 0
            })
        );
    }
}
