//! The container engine.
//!
//! A container is a balanced tree of nodes. Leaves hold entries in one of the
//! [`LeafLayout`]s, branches hold one `(child, totals)` entry per child, where totals is the
//! [`packtree_core::Accumulator`] `[count, sum]` of everything below the child. Positions are
//! found by descending on the count column, map keys and byte offsets by descending on the sum
//! column.
//!
//! The engine is split into parts, each a trait implemented for every context that supplies
//! the capabilities it needs:
//!
//! - [`FindOps`]: descent, lookups and iteration. Needs a [`ReadContext`].
//! - [`CowOps`]: copy-on-write of paths and nodes. Needs a [`TreeContext`].
//! - [`InsertOps`]: leaf edits, update propagation and splits.
//! - [`RemoveOps`]: removal, merges, redistribution and root collapse.
//!
//! Every non-root node keeps `size >= capacity / 2`. Overflow is not an error: a local edit
//! that does not fit is rolled back, the node is split and the edit retried on the half that
//! owns its position. Removals repair nodes that end with `2 * size <= capacity` by merging
//! them with a sibling, or moving entries over from one when a merge does not fit.

use crate::block::{BlockId, ContainerId, SnapshotId};
use crate::error::Result;
use crate::node::{LeafEntry, LeafLayout, NodeHeader, NodeKind};
use crate::store::{BlockStore, Capacities, ContainerRoot};

mod cow;
mod find;
mod insert;
mod iter;
mod path;
mod remove;
mod verify;


pub use cow::{CowOps, NodeCheckpoint};
pub use find::{FindOps, Located};
pub use insert::{EditCursor, InsertOps};
pub use iter::Iter;
pub use path::{PathEntry, TreePath, MAX_TREE_HEIGHT};
pub use remove::{MergeScope, RemoveOps};

/// The largest sum of indexed values a container holds. Map keys are bounded by it too, as
/// the sum of a map is its last key.
pub const MAX_SUM: u64 = i64::MAX as u64;

/// Read access to one container: the capabilities [`FindOps`] needs.
pub trait ReadContext {
    fn store(&self) -> &BlockStore;

    /// The current root block.
    fn root(&self) -> BlockId;

    fn layout(&self) -> LeafLayout;

    /// Entry limits of this container's nodes.
    fn capacities(&self) -> Capacities;
}

/// Write access to one container within a writable snapshot.
pub trait TreeContext: ReadContext {
    fn store_mut(&mut self) -> &mut BlockStore;

    /// The active snapshot. Only its nodes are mutated in place.
    fn snapshot(&self) -> SnapshotId;

    /// Point the container at a new root. Reference counts are the caller's business.
    fn set_root(&mut self, root: BlockId) -> Result<()>;

    /// Create an empty, unreferenced node at `level` owned by the active snapshot.
    fn create_node(&mut self, level: usize, root: bool) -> Result<BlockId>;
}

/// One element of a container, as returned by lookups and iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Item {
    Value(u64),
    /// A map entry with its absolute key.
    Entry { key: u64, value: Option<u64> },
    /// A blob of `len` bytes kept in `block`.
    Blob { len: u64, block: BlockId },
}

impl Item {
    /// Turn a leaf entry into an item. `sum_before` is the sum of the indexed values before
    /// it in the container, which makes map keys absolute.
    pub fn from_leaf(entry: LeafEntry, sum_before: u64) -> Self {
        match entry {
            LeafEntry::Value(v) => Item::Value(v),
            LeafEntry::Key { delta, value } => Item::Entry {
                key: sum_before + delta,
                value,
            },
            LeafEntry::Blob { len, block } => Item::Blob { len, block },
        }
    }
}

/// A container of a writable snapshot, open for updates.
///
/// Obtained from [`BlockStore::tree`]. Holds the store exclusively until dropped.
pub struct Tree<'s> {
    store: &'s mut BlockStore,
    snapshot: SnapshotId,
    container: ContainerId,
    root: ContainerRoot,
    capacities: Capacities,
}

impl<'s> Tree<'s> {
    pub(crate) fn new(
        store: &'s mut BlockStore,
        snapshot: SnapshotId,
        container: ContainerId,
        root: ContainerRoot,
        capacities: Capacities,
    ) -> Self {
        Tree {
            store,
            snapshot,
            container,
            root,
            capacities,
        }
    }

    pub fn container(&self) -> ContainerId {
        self.container
    }
}

impl ReadContext for Tree<'_> {
    fn store(&self) -> &BlockStore {
        &*self.store
    }

    fn root(&self) -> BlockId {
        self.root.root
    }

    fn layout(&self) -> LeafLayout {
        self.root.layout
    }

    fn capacities(&self) -> Capacities {
        self.capacities
    }
}

impl TreeContext for Tree<'_> {
    fn store_mut(&mut self) -> &mut BlockStore {
        &mut *self.store
    }

    fn snapshot(&self) -> SnapshotId {
        self.snapshot
    }

    fn set_root(&mut self, root: BlockId) -> Result<()> {
        self.store.set_container_root(self.snapshot, self.container, root)?;
        tracing::debug!(
            snapshot = %self.snapshot,
            container = %self.container,
            from = %self.root.root,
            to = %root,
            "new root"
        );
        self.root.root = root;
        Ok(())
    }

    fn create_node(&mut self, level: usize, root: bool) -> Result<BlockId> {
        let layout = self.root.layout;
        let kind = if level == 0 {
            NodeKind::Leaf(layout)
        } else {
            NodeKind::Branch
        };
        self.store.create_node(
            self.snapshot,
            layout.ctr_type_hash(),
            NodeHeader {
                kind,
                level: level as u8,
                root,
            },
        )
    }
}

/// A container of any snapshot, open for reading.
#[derive(Clone, Copy)]
pub struct TreeReader<'s> {
    store: &'s BlockStore,
    root: ContainerRoot,
}

impl<'s> TreeReader<'s> {
    pub(crate) fn new(store: &'s BlockStore, root: ContainerRoot) -> Self {
        TreeReader { store, root }
    }
}

impl ReadContext for TreeReader<'_> {
    fn store(&self) -> &BlockStore {
        self.store
    }

    fn root(&self) -> BlockId {
        self.root.root
    }

    fn layout(&self) -> LeafLayout {
        self.root.layout
    }

    fn capacities(&self) -> Capacities {
        self.store.capacities(self.root.layout)
    }
}
