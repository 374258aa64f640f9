//! Removal and rebalancing.

use super::{EditCursor, InsertOps, Item, TreePath};
use crate::block::BlockId;
use crate::error::{Error, Result};
use crate::metrics::Metric;
use crate::node::{LeafEntry, LeafLayout, NodeRef};

/// Which leaves a range removal may merge once the range is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeScope {
    /// Only siblings. The leaves that end up adjacent across the removed range are left apart
    /// when they hang off different branches.
    #[default]
    SameParent,
    /// Also the two leaves adjacent across the removed range, whatever their parents.
    AnyParent,
}

/// Removing entries and keeping nodes at least half full.
pub trait RemoveOps: InsertOps {
    /// Remove the element at `pos` and return it.
    fn remove(&mut self, pos: u64) -> Result<Item> {
        let metrics = self.store().metrics().clone();
        let _timer = metrics.record(Metric::UpdateTime);

        let len = self.len()?;
        let located = self.find_position(pos)?;
        if !located.found {
            return Err(Error::OutOfBounds {
                position: pos,
                size: len,
            });
        }
        let entry = self.open_leaf(located.path.leaf())?.entry(located.idx);

        let mut located = match entry {
            LeafEntry::Key { delta, .. } if pos + 1 < len => {
                // the next key absorbs the removed delta.
                self.add_to_indexed(pos + 1, delta)?;
                self.find_position(pos)?
            }
            _ => located,
        };
        self.leaf_edit(&mut located.path, located.idx, EditCursor::Edit, |l, idx| {
            l.remove(idx, idx + 1);
            Ok(())
        })?;
        if let LeafEntry::Blob { block, .. } = entry {
            self.store_mut().unref_cascade(block)?;
        }

        self.rebalance_around(pos)?;
        Ok(Item::from_leaf(entry, located.sum_before))
    }

    /// Remove elements `start..end`, merging only siblings afterwards.
    fn remove_range(&mut self, start: u64, end: u64) -> Result<()> {
        self.remove_range_with(start, end, MergeScope::SameParent)
    }

    /// Remove elements `start..end`.
    ///
    /// Nodes wholly inside the range are released, the nodes the range cuts through are
    /// trimmed, then the two boundaries are rebalanced. With [`MergeScope::AnyParent`] the
    /// leaves left adjacent across the range are merged even when their parents differ.
    fn remove_range_with(&mut self, start: u64, end: u64, scope: MergeScope) -> Result<()> {
        let len = self.len()?;
        if start > end || end > len {
            return Err(Error::OutOfBounds {
                position: end,
                size: len,
            });
        }
        if start == end {
            return Ok(());
        }
        let metrics = self.store().metrics().clone();
        let _timer = metrics.record(Metric::UpdateTime);

        if self.layout() == LeafLayout::Map && end < len {
            // the key at `end` absorbs the deltas of the removed keys.
            let before_end = self.find_position(end)?.sum_before;
            let before_start = self.find_position(start)?.sum_before;
            self.add_to_indexed(end, before_end - before_start)?;
        }

        let root = self.mutable_root()?;
        self.remove_subrange(root, start, end)?;
        tracing::debug!(start, end, ?scope, "removed range");

        self.rebalance_around(start)?;
        if scope == MergeScope::AnyParent {
            self.merge_across(start)?;
        }
        Ok(())
    }

    /// Remove the value under `key`, returning it if the key was present.
    fn map_remove(&mut self, key: u64) -> Result<Option<Option<u64>>> {
        self.require_layout(LeafLayout::Map)?;
        let located = self.find_key(key)?;
        if !located.found {
            return Ok(None);
        }
        match self.open_leaf(located.path.leaf())?.entry(located.idx) {
            LeafEntry::Key { delta, .. } if located.sum_before + delta == key => {}
            _ => return Ok(None),
        }
        match self.remove(located.position)? {
            Item::Entry { value, .. } => Ok(Some(value)),
            _ => Err(Error::structural("map leaf without a map entry")),
        }
    }

    /// Remove all keys in `from..to`, returning how many there were.
    fn map_remove_range(&mut self, from: u64, to: u64) -> Result<u64> {
        self.require_layout(LeafLayout::Map)?;
        if from >= to {
            return Ok(0);
        }
        let start = self.find_key(from)?.position;
        let end = self.find_key(to)?.position;
        self.remove_range(start, end)?;
        Ok(end - start)
    }

    /// Remove elements `start..end`, counted from the start of the mutable node `node`.
    fn remove_subrange(&mut self, node: BlockId, start: u64, end: u64) -> Result<()> {
        let entries = match self.open_node(node)?.1 {
            NodeRef::Branch(branch) => Some(branch.entries(0, branch.size())),
            NodeRef::Leaf(_) => None,
        };
        let Some(entries) = entries else {
            let (start, end) = (start as usize, end as usize);
            let blobs = self.with_leaf_mut(node, |l| {
                let blobs = l.as_ref().blob_blocks(start, end);
                l.remove(start, end);
                blobs
            })?;
            for blob in blobs {
                self.store_mut().unref_cascade(blob)?;
            }
            return Ok(());
        };

        let mut covered = Vec::new();
        let mut offset = 0;
        for (idx, (_, totals)) in entries.iter().enumerate() {
            let (lo, hi) = (offset, offset + totals.count() as u64);
            offset = hi;
            if hi <= start || lo >= end {
                continue;
            }
            if start <= lo && hi <= end {
                covered.push(idx);
                continue;
            }
            let child = self.make_child_mutable(node, idx)?;
            self.remove_subrange(child, start.max(lo) - lo, end.min(hi) - lo)?;
            let totals = self.node_totals(child)?;
            self.with_branch_mut(node, |b| b.set_entry(idx, totals))?;
        }

        if let (Some(&first), Some(&last)) = (covered.first(), covered.last()) {
            let released = self.with_branch_mut(node, |b| {
                let children = b.as_ref().children(first, last + 1);
                b.remove(first, last + 1);
                children
            })?;
            for child in released {
                self.store_mut().unref_cascade(child)?;
            }
        }
        Ok(())
    }

    /// Rebalance the nodes around the boundary left by a removal at `pos`, then collapse the
    /// root.
    fn rebalance_around(&mut self, pos: u64) -> Result<()> {
        if pos > 0 {
            self.rebalance_at(pos - 1)?;
        }
        if pos < self.len()? {
            self.rebalance_at(pos)?;
        }
        self.collapse_root()
    }

    /// Rebalance the path to the element at `pos` until nothing changes.
    fn rebalance_at(&mut self, pos: u64) -> Result<()> {
        loop {
            self.collapse_root()?;
            let path = self.find_position(pos)?.path;
            if !self.rebalance(path, 0)? {
                return Ok(());
            }
        }
    }

    /// Repair every node of `path` from level `from` up to below the root that is at most half
    /// full: drop it if empty, else merge it with a sibling, else move entries over from one.
    ///
    /// Returns whether anything changed. Levels below the repaired ones are stale afterwards.
    fn rebalance(&mut self, mut path: TreePath, from: usize) -> Result<bool> {
        let mut changed = false;
        for level in from..path.root_level() {
            let node = path.node(level);
            let size = self.node_size(node)?;
            let capacity = self.capacities().at_level(level);
            if 2 * size > capacity {
                continue;
            }

            self.cow_clone_path(&mut path, level + 1)?;
            let parent = path.node(level + 1);
            let idx = path.parent_idx(level);
            if size == 0 {
                self.with_branch_mut(parent, |b| b.remove(idx, idx + 1))?;
                self.store_mut().unref_cascade(node)?;
                tracing::debug!(%node, level, "dropped empty node");
                changed = true;
                continue;
            }

            let parent_size = self.node_size(parent)?;
            if parent_size < 2 {
                continue;
            }
            let has_right = idx + 1 < parent_size;
            if (has_right && self.try_merge(parent, idx, level)?)
                || (idx > 0 && self.try_merge(parent, idx - 1, level)?)
            {
                changed = true;
                continue;
            }
            let left_idx = if has_right { idx } else { idx - 1 };
            changed |= self.redistribute(parent, left_idx, level)?;
        }
        Ok(changed)
    }

    /// Merge child `left_idx + 1` of the mutable branch `parent` into child `left_idx`, if
    /// their entries fit one node.
    fn try_merge(&mut self, parent: BlockId, left_idx: usize, level: usize) -> Result<bool> {
        let right = self.open_branch(parent)?.child(left_idx + 1);
        let left_size = self.node_size(self.open_branch(parent)?.child(left_idx))?;
        let right_size = self.node_size(right)?;
        if left_size + right_size > self.capacities().at_level(level) {
            return Ok(false);
        }

        let left = self.make_child_mutable(parent, left_idx)?;
        if !self.merge_into(left, right)? {
            return Ok(false);
        }
        let totals = self.node_totals(left)?;
        self.with_branch_mut(parent, |b| {
            b.remove(left_idx + 1, left_idx + 2);
            b.set_entry(left_idx, totals);
        })?;
        self.store_mut().unref_cascade(right)?;

        self.count_metric(Metric::NodeMerges);
        tracing::debug!(%left, %right, level, "merged nodes");
        Ok(true)
    }

    /// Even out the sizes of children `left_idx` and `left_idx + 1` of the mutable branch
    /// `parent`. Returns whether entries moved.
    fn redistribute(&mut self, parent: BlockId, left_idx: usize, level: usize) -> Result<bool> {
        let branch = self.open_branch(parent)?;
        let (left, right) = (branch.child(left_idx), branch.child(left_idx + 1));
        let left_size = self.node_size(left)?;
        let right_size = self.node_size(right)?;
        let moved = left_size.abs_diff(right_size) / 2;
        if moved == 0 {
            return Ok(false);
        }

        let left = self.make_child_mutable(parent, left_idx)?;
        let right = self.make_child_mutable(parent, left_idx + 1)?;
        self.with_pair_mut(left, right, |l, r| {
            if left_size < right_size {
                l.take_front(r, moved)
            } else {
                l.split_to(r, left_size - moved)
            }
        })?
        .map_err(|_| {
            Error::structural(format!("moving {moved} entries between {left} and {right}"))
        })?;

        let left_totals = self.node_totals(left)?;
        let right_totals = self.node_totals(right)?;
        self.with_branch_mut(parent, |b| {
            b.set_entry(left_idx, left_totals);
            b.set_entry(left_idx + 1, right_totals);
        })?;

        self.count_metric(Metric::Redistributions);
        tracing::debug!(%left, %right, level, moved, "redistributed entries");
        Ok(true)
    }

    /// Replace a root branch with a single child by that child, repeatedly. A root branch
    /// over no elements becomes an empty leaf.
    fn collapse_root(&mut self) -> Result<()> {
        loop {
            let root = self.root();
            let (header, node) = self.open_node(root)?;
            let NodeRef::Branch(branch) = node else {
                return Ok(());
            };

            if branch.count() == 0 {
                let leaf = self.create_node(0, true)?;
                self.replace_root(leaf)?;
                tracing::debug!(old = %root, new = %leaf, "emptied tree");
                return Ok(());
            }
            if branch.size() != 1 {
                return Ok(());
            }

            let root = self.mutable_root()?;
            let child = self.make_child_mutable(root, 0)?;
            self.store_mut().set_root_flag(child, true)?;
            self.replace_root(child)?;
            self.count_metric(Metric::RootCollapses);
            tracing::debug!(old = %root, new = %child, level = header.level, "collapsed root");
        }
    }

    /// Merge the leaves holding `pos - 1` and `pos` if they have different parents and their
    /// entries fit one leaf, then rebalance what the merge left behind.
    fn merge_across(&mut self, pos: u64) -> Result<()> {
        if pos == 0 || pos >= self.len()? {
            return Ok(());
        }
        let mut left = self.find_position(pos - 1)?.path;
        let right = self.find_position(pos)?.path;
        if right.root_level() == 0 || left.node(1) == right.node(1) {
            return Ok(());
        }
        let capacity = self.capacities().leaf;
        if self.node_size(left.leaf())? + self.node_size(right.leaf())? > capacity {
            return Ok(());
        }

        self.cow_clone_path(&mut left, 0)?;
        let mut right = self.find_position(pos)?.path;
        self.cow_clone_path(&mut right, 1)?;
        let (left_leaf, right_leaf) = (left.leaf(), right.leaf());
        if !self.merge_into(left_leaf, right_leaf)? {
            return Ok(());
        }

        let idx = right.parent_idx(0);
        self.with_branch_mut(right.node(1), |b| b.remove(idx, idx + 1))?;
        self.store_mut().unref_cascade(right_leaf)?;
        self.refresh_path(&left, 0)?;
        self.refresh_path(&right, 1)?;
        self.count_metric(Metric::NodeMerges);
        tracing::debug!(left = %left_leaf, right = %right_leaf, "merged leaves across parents");

        self.rebalance(right, 1)?;
        self.rebalance_around(pos)
    }
}

impl<T: InsertOps + ?Sized> RemoveOps for T {}
