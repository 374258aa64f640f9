//! Root-to-leaf cursors.

use arrayvec::ArrayVec;

use crate::block::BlockId;
use crate::error::{Error, Result};

/// The maximum number of levels of a tree, leaves included.
pub const MAX_TREE_HEIGHT: usize = 32;

/// One level of a [`TreePath`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathEntry {
    pub node: BlockId,
    /// Index of `node` among the children of the node one level up. 0 at the root.
    pub parent_idx: usize,
}

/// The nodes from the root down to a leaf, indexed by level: level 0 is the leaf and
/// `root_level()` the root.
///
/// Structural edits rewrite paths wholesale. A path is only meaningful until the next edit
/// that did not go through it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreePath {
    levels: ArrayVec<PathEntry, MAX_TREE_HEIGHT>,
}

impl TreePath {
    /// A path of `height` levels, all pointing nowhere.
    pub(crate) fn with_height(height: usize) -> Result<Self> {
        if height == 0 || height > MAX_TREE_HEIGHT {
            return Err(Error::structural(format!("tree of height {height}")));
        }
        let mut levels = ArrayVec::new();
        for _ in 0..height {
            levels.push(PathEntry {
                node: BlockId::INVALID,
                parent_idx: 0,
            });
        }
        Ok(TreePath { levels })
    }

    pub fn height(&self) -> usize {
        self.levels.len()
    }

    pub fn root_level(&self) -> usize {
        self.levels.len() - 1
    }

    pub fn root(&self) -> BlockId {
        self.node(self.root_level())
    }

    pub fn leaf(&self) -> BlockId {
        self.node(0)
    }

    pub fn node(&self, level: usize) -> BlockId {
        self.levels[level].node
    }

    pub fn parent_idx(&self, level: usize) -> usize {
        self.levels[level].parent_idx
    }

    pub fn set_node(&mut self, level: usize, node: BlockId) {
        self.levels[level].node = node;
    }

    pub fn set_parent_idx(&mut self, level: usize, idx: usize) {
        self.levels[level].parent_idx = idx;
    }

    /// Put a new root above the current one, which becomes its first child.
    pub fn push_root(&mut self, root: BlockId) -> Result<()> {
        if self.levels.is_full() {
            return Err(Error::structural("tree height limit reached"));
        }
        let level = self.root_level();
        self.levels[level].parent_idx = 0;
        self.levels.push(PathEntry {
            node: root,
            parent_idx: 0,
        });
        Ok(())
    }

    /// Drop the root level. The old root's only child becomes the root.
    pub fn pop_root(&mut self) {
        assert!(self.levels.len() > 1, "cannot pop the root of a single-level path");
        self.levels.pop();
        let level = self.root_level();
        self.levels[level].parent_idx = 0;
    }

    /// Replace levels `level..` with those of `other`.
    pub fn adopt_from(&mut self, other: &TreePath, level: usize) {
        self.levels.truncate(level);
        self.levels.extend(other.levels[level..].iter().copied());
    }

    /// The entries from the root down.
    pub fn top_down(&self) -> impl Iterator<Item = &PathEntry> {
        self.levels.iter().rev()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(nodes: &[u64]) -> TreePath {
        // nodes are given from the leaf up.
        let mut path = TreePath::with_height(nodes.len()).unwrap();
        for (level, node) in nodes.iter().enumerate() {
            path.set_node(level, BlockId(*node));
            path.set_parent_idx(level, level);
        }
        path
    }

    #[test]
    fn push_and_pop_root() {
        let mut p = path(&[1, 2]);
        assert_eq!(p.root(), BlockId(2));
        p.set_parent_idx(1, 7);
        p.push_root(BlockId(3)).unwrap();
        assert_eq!(p.height(), 3);
        assert_eq!(p.root(), BlockId(3));
        assert_eq!(p.parent_idx(1), 0);

        p.pop_root();
        assert_eq!(p.root(), BlockId(2));
        assert_eq!(p.leaf(), BlockId(1));
    }

    #[test]
    fn height_is_bounded() {
        assert!(TreePath::with_height(0).is_err());
        assert!(TreePath::with_height(MAX_TREE_HEIGHT + 1).is_err());
        let mut p = TreePath::with_height(MAX_TREE_HEIGHT).unwrap();
        assert!(p.push_root(BlockId(1)).is_err());
    }

    #[test]
    fn adopt_replaces_upper_levels() {
        let mut left = path(&[1, 2, 3]);
        let right = path(&[4, 5, 6, 7]);
        left.adopt_from(&right, 1);
        assert_eq!(left.height(), 4);
        assert_eq!(left.leaf(), BlockId(1));
        assert_eq!(left.node(1), BlockId(5));
        assert_eq!(left.root(), BlockId(7));
        assert_eq!(
            left.top_down().map(|e| e.node).collect::<Vec<_>>(),
            vec![BlockId(7), BlockId(6), BlockId(5), BlockId(1)]
        );
    }
}
