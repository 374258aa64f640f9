//! Copy-on-write.
//!
//! A node may be mutated in place only if it belongs to the active snapshot. Everything else
//! is cloned first, top-down, so that a clone's parent is always already writable when the
//! child pointer is rewritten. A clone takes a reference on everything its payload points to,
//! its parent's pointer moves from the original to the clone.

use super::{FindOps, TreeContext, TreePath};
use crate::block::BlockId;
use crate::error::{Error, Result};
use crate::metrics::Metric;
use crate::node::{BranchMut, LeafMut, NodeKind, NodeMut, NodeRef};
use crate::store::BlockStore;

/// The payload of a node before an edit, to roll the edit back.
pub struct NodeCheckpoint {
    id: BlockId,
    payload: Vec<u8>,
}

impl NodeCheckpoint {
    pub fn take(store: &BlockStore, id: BlockId) -> Result<Self> {
        Ok(NodeCheckpoint {
            id,
            payload: store.get_block(id)?.payload().to_vec(),
        })
    }

    pub fn restore(self, store: &mut BlockStore) -> Result<()> {
        store
            .block_mut(self.id)?
            .payload_mut()
            .copy_from_slice(&self.payload);
        Ok(())
    }
}

/// Copy-on-write of nodes and paths.
pub trait CowOps: TreeContext + FindOps {
    fn is_mutable(&self, id: BlockId) -> Result<bool> {
        Ok(self.store().get_block(id)?.snapshot_id() == self.snapshot())
    }

    /// Fail unless `id` may be mutated in place.
    fn update_guard(&self, id: BlockId) -> Result<()> {
        let owner = self.store().get_block(id)?.snapshot_id();
        let active = self.snapshot();
        if owner != active {
            return Err(Error::ImmutableNode {
                block: id,
                owner,
                active,
            });
        }
        Ok(())
    }

    fn with_node_mut<R>(
        &mut self,
        id: BlockId,
        f: impl FnOnce(&mut NodeMut<'_>) -> R,
    ) -> Result<R> {
        self.update_guard(id)?;
        let block = self.store_mut().block_mut(id)?;
        let mut node = NodeMut::open(block.payload_mut())?;
        Ok(f(&mut node))
    }

    fn with_branch_mut<R>(
        &mut self,
        id: BlockId,
        f: impl FnOnce(&mut BranchMut<'_>) -> R,
    ) -> Result<R> {
        let layout = self.layout();
        self.with_node_mut(id, |node| match node {
            NodeMut::Branch(branch) => Ok(f(branch)),
            NodeMut::Leaf(_) => Err(Error::UnexpectedNode {
                block: id,
                expected: NodeKind::Branch,
                found: NodeKind::Leaf(layout),
            }),
        })?
    }

    fn with_leaf_mut<R>(
        &mut self,
        id: BlockId,
        f: impl FnOnce(&mut LeafMut<'_>) -> R,
    ) -> Result<R> {
        let layout = self.layout();
        self.with_node_mut(id, |node| match node {
            NodeMut::Leaf(leaf) => Ok(f(leaf)),
            NodeMut::Branch(_) => Err(Error::UnexpectedNode {
                block: id,
                expected: NodeKind::Leaf(layout),
                found: NodeKind::Branch,
            }),
        })?
    }

    /// Two distinct nodes of the same kind, both mutable.
    fn with_pair_mut<R>(
        &mut self,
        a: BlockId,
        b: BlockId,
        f: impl FnOnce(&mut NodeMut<'_>, &mut NodeMut<'_>) -> R,
    ) -> Result<R> {
        self.update_guard(a)?;
        self.update_guard(b)?;
        let (block_a, block_b) = self.store_mut().pair_mut(a, b)?;
        let mut node_a = NodeMut::open(block_a.payload_mut())?;
        let mut node_b = NodeMut::open(block_b.payload_mut())?;
        Ok(f(&mut node_a, &mut node_b))
    }

    /// Clone a block into the active snapshot, referencing everything it points to.
    fn clone_with_references(&mut self, id: BlockId) -> Result<BlockId> {
        let snapshot = self.snapshot();
        let clone = self.store_mut().clone_block(id, snapshot)?;
        for child in self.store().references_of(clone)? {
            self.store_mut().ref_block(child)?;
        }
        Ok(clone)
    }

    /// Make `root` the container root: the snapshot's reference moves from the old root.
    fn replace_root(&mut self, root: BlockId) -> Result<()> {
        let old = self.root();
        self.store_mut().ref_block(root)?;
        self.set_root(root)?;
        self.store_mut().unref_cascade(old)
    }

    /// The root, cloned first if it is not mutable.
    fn mutable_root(&mut self) -> Result<BlockId> {
        let root = self.root();
        if self.is_mutable(root)? {
            return Ok(root);
        }
        let clone = self.clone_with_references(root)?;
        self.replace_root(clone)?;
        Ok(clone)
    }

    /// Child `idx` of the mutable branch `parent`, cloned first if it is not mutable.
    fn make_child_mutable(&mut self, parent: BlockId, idx: usize) -> Result<BlockId> {
        let child = self.open_branch(parent)?.child(idx);
        if self.is_mutable(child)? {
            return Ok(child);
        }
        let clone = self.clone_with_references(child)?;
        self.with_branch_mut(parent, |b| b.set_child(idx, clone))?;
        self.store_mut().ref_block(clone)?;
        self.store_mut().unref_cascade(child)?;
        Ok(clone)
    }

    /// Make every node of `path` from the root down to `level` mutable, rewriting the path to
    /// point at the clones.
    fn cow_clone_path(&mut self, path: &mut TreePath, level: usize) -> Result<()> {
        for l in (level..=path.root_level()).rev() {
            let node = path.node(l);
            if self.is_mutable(node)? {
                continue;
            }
            let clone = if l == path.root_level() {
                self.mutable_root()?
            } else {
                self.make_child_mutable(path.node(l + 1), path.parent_idx(l))?
            };
            path.set_node(l, clone);
        }
        Ok(())
    }

    /// Append all entries of `right` to the mutable node `left`, giving `left` a reference on
    /// everything it now points to. `right` itself is untouched.
    ///
    /// Returns `false` if the entries do not fit.
    fn merge_into(&mut self, left: BlockId, right: BlockId) -> Result<bool> {
        self.update_guard(left)?;
        let moved = {
            let (left_block, right_block) = self.store_mut().pair_mut(left, right)?;
            let mut left_node = NodeMut::open(left_block.payload_mut())?;
            let (_, right_node) = NodeRef::open(right_block.payload())?;
            if left_node.merge_with(&right_node).is_err() {
                return Ok(false);
            }
            right_node.references()
        };
        for id in moved {
            self.store_mut().ref_block(id)?;
        }
        Ok(true)
    }

    /// Count a metric on the store.
    fn count_metric(&self, metric: Metric) {
        self.store().metrics().count(metric);
    }
}

impl<T: TreeContext + ?Sized> CowOps for T {}
