//! Descent and lookups.

use packtree_core::{
    accumulator::{COUNT, SUM},
    packed::SearchType,
    Accumulator,
};

use super::{iter::Iter, path::MAX_TREE_HEIGHT, Item, ReadContext, TreePath, TreeReader};
use crate::block::BlockId;
use crate::error::{Error, Result};
use crate::node::{BranchRef, LeafEntry, LeafLayout, LeafRef, NodeHeader, NodeKind, NodeRef};
use crate::store::ContainerRoot;

/// The outcome of a descent: a path to a leaf and an index within it.
#[derive(Debug, Clone)]
pub struct Located {
    pub path: TreePath,
    /// Index within the leaf. Equal to the leaf size when the descent ran off the end.
    pub idx: usize,
    /// Number of elements before `idx` in the container.
    pub position: u64,
    /// Sum of the indexed values before `idx` in the container.
    pub sum_before: u64,
    /// Whether `idx` names an element.
    pub found: bool,
}

/// Lookups, available on any container.
pub trait FindOps: ReadContext {
    fn open_node(&self, id: BlockId) -> Result<(NodeHeader, NodeRef<'_>)> {
        NodeRef::open(self.store().get_block(id)?.payload())
    }

    fn open_branch(&self, id: BlockId) -> Result<BranchRef<'_>> {
        match self.open_node(id)? {
            (_, NodeRef::Branch(b)) => Ok(b),
            (header, NodeRef::Leaf(_)) => Err(Error::UnexpectedNode {
                block: id,
                expected: NodeKind::Branch,
                found: header.kind,
            }),
        }
    }

    fn open_leaf(&self, id: BlockId) -> Result<LeafRef<'_>> {
        match self.open_node(id)? {
            (_, NodeRef::Leaf(l)) => Ok(l),
            (header, NodeRef::Branch(_)) => Err(Error::UnexpectedNode {
                block: id,
                expected: NodeKind::Leaf(self.layout()),
                found: header.kind,
            }),
        }
    }

    fn node_size(&self, id: BlockId) -> Result<usize> {
        Ok(self.open_node(id)?.1.size())
    }

    /// The accumulator of a node: what its parent keeps for it.
    fn node_totals(&self, id: BlockId) -> Result<Accumulator> {
        Ok(self.open_node(id)?.1.totals())
    }

    fn require_layout(&self, expected: LeafLayout) -> Result<()> {
        let actual = self.layout();
        if actual != expected {
            return Err(Error::LayoutMismatch { expected, actual });
        }
        Ok(())
    }

    /// `[count, sum]` of the whole container.
    fn totals(&self) -> Result<Accumulator> {
        self.node_totals(self.root())
    }

    /// Number of elements.
    fn len(&self) -> Result<u64> {
        Ok(self.totals()?.count() as u64)
    }

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Number of levels, leaves included.
    fn height(&self) -> Result<usize> {
        Ok(self.open_node(self.root())?.0.level as usize + 1)
    }

    /// Descend from the root to the leaf where the running total of `column` first
    /// satisfies `search` against `target`.
    ///
    /// On the count column the target is a position and the leaf index is exact. If no entry
    /// satisfies the search, the descent ends past the last entry of the last leaf.
    fn descend(&self, column: usize, search: SearchType, target: u64) -> Result<Located> {
        let root = self.root();
        let root_level = self.open_node(root)?.0.level as usize;
        if root_level >= MAX_TREE_HEIGHT {
            return Err(Error::structural(format!(
                "root {root} at level {root_level}"
            )));
        }

        let mut path = TreePath::with_height(root_level + 1)?;
        let mut before = Accumulator::default();
        let mut remaining = target;
        let mut node = root;
        let mut parent_idx = 0;

        for level in (0..=root_level).rev() {
            path.set_node(level, node);
            path.set_parent_idx(level, parent_idx);

            let (header, opened) = self.open_node(node)?;
            if header.level as usize != level {
                return Err(Error::structural(format!(
                    "block {node} at level {} where level {level} was expected",
                    header.level
                )));
            }
            match opened {
                NodeRef::Branch(branch) => {
                    let size = branch.size();
                    if size == 0 {
                        return Err(Error::structural(format!("empty branch {node}")));
                    }
                    let found = branch.find(search, column, remaining);
                    let idx = found.idx.min(size - 1);
                    let prefix = branch.prefix(idx);
                    remaining -= prefix.get(column) as u64;
                    before += prefix;
                    parent_idx = idx;
                    node = branch.child(idx);
                }
                NodeRef::Leaf(leaf) => {
                    let size = leaf.size();
                    let idx = if column == COUNT {
                        (remaining as usize).min(size)
                    } else {
                        leaf.find(search, remaining).idx
                    };
                    return Ok(Located {
                        idx,
                        position: before.count() as u64 + idx as u64,
                        sum_before: before.sum() as u64 + leaf.prefix(idx),
                        found: idx < size,
                        path,
                    });
                }
            }
        }
        Err(Error::structural(format!("no leaf below {root}")))
    }

    /// Locate the element at `pos`. `pos == len` locates the end of the container.
    fn find_position(&self, pos: u64) -> Result<Located> {
        self.descend(COUNT, SearchType::GT, pos)
    }

    /// Locate the first map key at or above `key`.
    fn find_key(&self, key: u64) -> Result<Located> {
        self.descend(SUM, SearchType::GE, key)
    }

    /// The element at `pos`.
    fn get(&self, pos: u64) -> Result<Item> {
        let located = self.find_position(pos)?;
        if !located.found {
            return Err(Error::OutOfBounds {
                position: pos,
                size: self.len()?,
            });
        }
        let entry = self.open_leaf(located.path.leaf())?.entry(located.idx);
        Ok(Item::from_leaf(entry, located.sum_before))
    }

    /// The element whose span of the running sum covers `offset`, as `(position, sum
    /// before it)`. `None` if `offset` is not below the total sum.
    ///
    /// For blob containers this finds the blob holding a byte offset.
    fn find_sum(&self, offset: u64) -> Result<Option<(u64, u64)>> {
        let located = self.descend(SUM, SearchType::GT, offset)?;
        Ok(located
            .found
            .then_some((located.position, located.sum_before)))
    }

    /// The value stored under `key`. `Some(None)` for a key without a value.
    fn map_get(&self, key: u64) -> Result<Option<Option<u64>>> {
        self.require_layout(LeafLayout::Map)?;
        let located = self.find_key(key)?;
        if !located.found {
            return Ok(None);
        }
        match self.open_leaf(located.path.leaf())?.entry(located.idx) {
            LeafEntry::Key { delta, value } if located.sum_before + delta == key => {
                Ok(Some(value))
            }
            _ => Ok(None),
        }
    }

    /// The bytes of the blob at `pos`.
    fn read_blob(&self, pos: u64) -> Result<Vec<u8>> {
        self.require_layout(LeafLayout::Blob)?;
        match self.get(pos)? {
            Item::Blob { block, .. } => Ok(self.store().blob_data(block)?.to_vec()),
            _ => Err(Error::structural("blob leaf without a blob entry")),
        }
    }

    /// The path to the leaf following the one `path` ends in.
    fn next_leaf(&self, path: &TreePath) -> Result<Option<TreePath>> {
        for level in 1..=path.root_level() {
            let idx = path.parent_idx(level - 1);
            let branch = self.open_branch(path.node(level))?;
            if idx + 1 >= branch.size() {
                continue;
            }

            let mut next = path.clone();
            next.set_node(level - 1, branch.child(idx + 1));
            next.set_parent_idx(level - 1, idx + 1);
            for below in (0..level - 1).rev() {
                let first = self.open_branch(next.node(below + 1))?.child(0);
                next.set_node(below, first);
                next.set_parent_idx(below, 0);
            }
            return Ok(Some(next));
        }
        Ok(None)
    }

    /// A read-only view of the container as it is now.
    fn reader(&self) -> TreeReader<'_> {
        TreeReader::new(
            self.store(),
            ContainerRoot {
                root: self.root(),
                layout: self.layout(),
            },
        )
    }

    /// Iterate over all elements in order.
    fn iter(&self) -> Iter<'_> {
        Iter::new(self.reader(), 0)
    }

    /// Iterate over the elements from `pos` on.
    fn iter_from(&self, pos: u64) -> Iter<'_> {
        Iter::new(self.reader(), pos)
    }

    /// Check the structure of the whole tree: levels, roles, type hashes, entries against
    /// child totals, packed indexes and node sizes.
    fn verify(&self) -> anyhow::Result<()> {
        super::verify::verify_tree(self)
    }
}

impl<T: ReadContext + ?Sized> FindOps for T {}
