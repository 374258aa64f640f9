//! Leaf edits, update propagation and splits.

use packtree_core::Accumulator;

use super::{path::MAX_TREE_HEIGHT, CowOps, NodeCheckpoint, TreePath, MAX_SUM};
use crate::block::BlockId;
use crate::error::{CapacityExceeded, Error, Result};
use crate::metrics::Metric;
use crate::node::{LeafEntry, LeafLayout, LeafMut};

/// What a leaf edit does at its index. Decides which half keeps the index when the leaf has
/// to be split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditCursor {
    /// Entries are inserted before the index. At the split point they go to the right half.
    Insert,
    /// The entry at the index is changed in place. At the split point it stays in the left
    /// half.
    Edit,
}

/// Where to split a node of `size` entries that an edit at `idx` did not fit into.
pub(crate) fn split_point(size: usize, idx: usize, cursor: EditCursor) -> usize {
    let mid = size / 2;
    if cursor == EditCursor::Edit && idx == mid && idx + 1 < size {
        idx + 1
    } else {
        mid
    }
}

/// Inserting and changing entries.
pub trait InsertOps: CowOps {
    /// Add a leaf's accumulator delta to every entry on the path above it.
    fn update_path(&mut self, path: &TreePath, delta: Accumulator) -> Result<()> {
        for level in 1..=path.root_level() {
            let idx = path.parent_idx(level - 1);
            self.with_branch_mut(path.node(level), |b| b.add_to_entry(idx, delta))??;
        }
        Ok(())
    }

    /// Fail unless replacing an indexed value of `removed` by one of `added` keeps the sum of
    /// the container within [`MAX_SUM`].
    fn check_sum(&self, removed: u64, added: u64) -> Result<()> {
        let sum = u64::try_from(self.totals()?.sum())
            .map_err(|_| Error::structural("negative container sum"))?;
        match sum.saturating_sub(removed).checked_add(added) {
            Some(new_sum) if new_sum <= MAX_SUM => Ok(()),
            _ => Err(Error::ValueOutOfRange {
                value: added,
                max: MAX_SUM,
            }),
        }
    }

    /// Rewrite the entries on the path above `level` from the actual totals of their nodes.
    fn refresh_path(&mut self, path: &TreePath, level: usize) -> Result<()> {
        for l in level..path.root_level() {
            let totals = self.node_totals(path.node(l))?;
            let idx = path.parent_idx(l);
            self.with_branch_mut(path.node(l + 1), |b| b.set_entry(idx, totals))?;
        }
        Ok(())
    }

    /// Insert one entry into a mutable branch, unless it is at capacity.
    fn try_branch_insert(
        &mut self,
        branch: BlockId,
        idx: usize,
        entry: (BlockId, Accumulator),
    ) -> Result<std::result::Result<(), CapacityExceeded>> {
        let capacity = self.capacities().branch;
        self.with_branch_mut(branch, |b| {
            if b.as_ref().size() >= capacity {
                return Err(CapacityExceeded);
            }
            b.insert(idx, &[entry])
        })
    }

    /// Apply `edit` to the leaf of `path` at `idx`, then propagate the change of the leaf's
    /// totals to the root.
    ///
    /// The path is made mutable first. If the edit runs out of room, or leaves the leaf above
    /// its capacity, the leaf is restored, split, and the edit retried on the half that owns
    /// `idx`; `path` then leads to that half. The edit may be called several times and must
    /// leave the leaf unchanged whenever it fails.
    fn leaf_edit<R>(
        &mut self,
        path: &mut TreePath,
        mut idx: usize,
        cursor: EditCursor,
        mut edit: impl FnMut(&mut LeafMut<'_>, usize) -> std::result::Result<R, CapacityExceeded>,
    ) -> Result<R> {
        let capacity = self.capacities().leaf;
        loop {
            self.cow_clone_path(path, 0)?;
            let leaf = path.leaf();
            let checkpoint = NodeCheckpoint::take(self.store(), leaf)?;

            let outcome = self.with_leaf_mut(leaf, |l| {
                let before = l.as_ref().totals();
                let output = edit(l, idx)?;
                if l.as_ref().size() > capacity {
                    return Err(CapacityExceeded);
                }
                Ok((output, l.as_ref().totals() - before))
            })?;

            match outcome {
                Ok((output, delta)) => {
                    if delta.is_zero() {
                        return Ok(output);
                    }
                    if let Err(e) = self.update_path(path, delta) {
                        // entries already updated are rewritten from the restored leaf.
                        checkpoint.restore(self.store_mut())?;
                        self.refresh_path(path, 0)?;
                        return Err(e);
                    }
                    return Ok(output);
                }
                Err(CapacityExceeded) => {
                    checkpoint.restore(self.store_mut())?;
                    let size = self.node_size(leaf)?;
                    if size < 2 {
                        return Err(Error::structural(format!(
                            "edit does not fit into leaf {leaf} of {size} entries"
                        )));
                    }
                    let split_at = split_point(size, idx, cursor);
                    let right = self.split_path(path, 0, split_at)?;
                    if idx >= split_at {
                        *path = right;
                        idx -= split_at;
                    }
                }
            }
        }
    }

    /// Split the mutable node at `level` of `path`, moving entries `split_at..` into a new
    /// right sibling, and return the path to the sibling.
    ///
    /// A root split first grows the tree by one level. The sibling's entry goes into the
    /// parent right after the node's own; a full parent is split the same way. `path` keeps
    /// leading to the left node, levels below `level` are left to the caller.
    fn split_path(
        &mut self,
        path: &mut TreePath,
        level: usize,
        split_at: usize,
    ) -> Result<TreePath> {
        if level == path.root_level() {
            self.new_root(path)?;
        }
        let left = path.node(level);
        let right = self.create_node(level, false)?;
        self.with_pair_mut(left, right, |l, r| l.split_to(r, split_at))?
            .map_err(|_| {
                Error::structural(format!("upper half of {left} does not fit a new node"))
            })?;
        let right_totals = self.node_totals(right)?;

        let mut right_path = path.clone();
        right_path.set_node(level, right);
        right_path.set_parent_idx(level, path.parent_idx(level) + 1);

        loop {
            let parent = right_path.node(level + 1);
            let idx = right_path.parent_idx(level);
            if self
                .try_branch_insert(parent, idx, (right, right_totals))?
                .is_ok()
            {
                break;
            }

            // both paths still share the full parent.
            let parent_split = self.node_size(parent)? / 2;
            let upper = self.split_path(path, level + 1, parent_split)?;
            if idx >= parent_split {
                right_path.adopt_from(&upper, level + 1);
                right_path.set_parent_idx(level, idx - parent_split);
            } else {
                right_path.adopt_from(path, level + 1);
            }
            let left_idx = path.parent_idx(level);
            if left_idx >= parent_split {
                path.adopt_from(&upper, level + 1);
                path.set_parent_idx(level, left_idx - parent_split);
            }
        }
        self.store_mut().ref_block(right)?;

        self.refresh_path(path, level)?;
        self.refresh_path(&right_path, level)?;

        self.count_metric(Metric::NodeSplits);
        tracing::debug!(%left, %right, level, split_at, "split node");
        Ok(right_path)
    }

    /// Put a new root branch above the root of `path`, with the old root as its only child.
    fn new_root(&mut self, path: &mut TreePath) -> Result<()> {
        let old = path.root();
        let level = path.height();
        if level >= MAX_TREE_HEIGHT {
            return Err(Error::structural("tree height limit reached"));
        }
        let root = self.create_node(level, true)?;
        self.update_guard(old)?;
        self.store_mut().set_root_flag(old, false)?;
        let totals = self.node_totals(old)?;
        self.with_branch_mut(root, |b| b.insert(0, &[(old, totals)]))?
            .map_err(|_| Error::structural("first entry does not fit a new root"))?;
        self.store_mut().ref_block(old)?;
        self.replace_root(root)?;
        path.push_root(root)?;
        tracing::debug!(%root, child = %old, level, "grew tree");
        Ok(())
    }

    /// Insert a leaf entry at `pos`. Blocks the entry points to are the caller's business.
    fn insert_at(&mut self, pos: u64, entry: LeafEntry) -> Result<()> {
        let mut located = self.find_position(pos)?;
        if located.position != pos {
            return Err(Error::OutOfBounds {
                position: pos,
                size: self.len()?,
            });
        }
        self.leaf_edit(&mut located.path, located.idx, EditCursor::Insert, |l, idx| {
            l.insert(idx, &[entry])
        })
    }

    /// Add `amount` to the indexed value of the element at `pos`.
    fn add_to_indexed(&mut self, pos: u64, amount: u64) -> Result<()> {
        let mut located = self.find_position(pos)?;
        if !located.found {
            return Err(Error::OutOfBounds {
                position: pos,
                size: self.len()?,
            });
        }
        let value = self.open_leaf(located.path.leaf())?.indexed(located.idx);
        let updated = value
            .checked_add(amount)
            .filter(|v| *v <= MAX_SUM)
            .ok_or_else(|| Error::structural(format!("indexed value {value} overflows")))?;
        self.leaf_edit(&mut located.path, located.idx, EditCursor::Edit, |l, idx| {
            l.set_indexed(idx, updated);
            Ok(())
        })
    }

    /// Insert `value` into a sequence so that it ends up at `pos`.
    fn insert_value(&mut self, pos: u64, value: u64) -> Result<()> {
        self.require_layout(LeafLayout::Sequence)?;
        let metrics = self.store().metrics().clone();
        let _timer = metrics.record(Metric::UpdateTime);
        self.check_sum(0, value)?;
        self.insert_at(pos, LeafEntry::Value(value))
    }

    /// Append `value` to a sequence.
    fn push_value(&mut self, value: u64) -> Result<()> {
        let len = self.len()?;
        self.insert_value(len, value)
    }

    /// Replace the value at `pos` of a sequence, returning the old one.
    fn update_value(&mut self, pos: u64, value: u64) -> Result<u64> {
        self.require_layout(LeafLayout::Sequence)?;
        let metrics = self.store().metrics().clone();
        let _timer = metrics.record(Metric::UpdateTime);
        let mut located = self.find_position(pos)?;
        if !located.found {
            return Err(Error::OutOfBounds {
                position: pos,
                size: self.len()?,
            });
        }
        let old = self.open_leaf(located.path.leaf())?.indexed(located.idx);
        self.check_sum(old, value)?;
        self.leaf_edit(&mut located.path, located.idx, EditCursor::Edit, |l, idx| {
            l.set_indexed(idx, value);
            Ok(old)
        })
    }

    /// Insert or replace a map entry, returning the previous value if the key was present.
    fn map_insert(&mut self, key: u64, value: Option<u64>) -> Result<Option<Option<u64>>> {
        self.require_layout(LeafLayout::Map)?;
        let metrics = self.store().metrics().clone();
        let _timer = metrics.record(Metric::UpdateTime);
        if key > MAX_SUM {
            return Err(Error::ValueOutOfRange {
                value: key,
                max: MAX_SUM,
            });
        }

        let mut located = self.find_key(key)?;
        if located.found {
            let existing = self.open_leaf(located.path.leaf())?.entry(located.idx);
            match existing {
                LeafEntry::Key { delta, value: previous } if located.sum_before + delta == key => {
                    self.leaf_edit(&mut located.path, located.idx, EditCursor::Edit, |l, idx| {
                        l.set_map_value(idx, value)
                    })?;
                    return Ok(Some(previous));
                }
                _ => {}
            }
        }

        // the entry at `idx`, if any, holds the next key and is in this leaf.
        let delta = key - located.sum_before;
        self.leaf_edit(&mut located.path, located.idx, EditCursor::Insert, |l, idx| {
            l.insert_key(idx, delta, value)
        })?;
        Ok(None)
    }

    /// Store `data` in a new blob block and insert a reference to it at `pos`.
    fn insert_blob(&mut self, pos: u64, data: &[u8]) -> Result<()> {
        self.require_layout(LeafLayout::Blob)?;
        let metrics = self.store().metrics().clone();
        let _timer = metrics.record(Metric::UpdateTime);

        let snapshot = self.snapshot();
        let ctr_type_hash = self.layout().ctr_type_hash();
        let block = self.store_mut().create_blob(snapshot, ctr_type_hash, data)?;
        let entry = LeafEntry::Blob {
            len: data.len() as u64,
            block,
        };
        match self.insert_at(pos, entry) {
            Ok(()) => {
                self.store_mut().ref_block(block)?;
                Ok(())
            }
            Err(e) => {
                self.store_mut().remove_block(block)?;
                Err(e)
            }
        }
    }
}

impl<T: CowOps + ?Sized> InsertOps for T {}
