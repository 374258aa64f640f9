//! The block store.
//!
//! Blocks live in a slab arena and are addressed by their slot. The store is the only place
//! ownership changes: a block's reference count moves only through [`BlockStore::ref_block`]
//! and [`BlockStore::unref_block`], and a block leaves the arena only once no pointer to it
//! remains.
//!
//! References come from two places: snapshot roots and pointers stored in other blocks
//! (branch children, blob blocks of blob leaves). A snapshot pins every container root it
//! maps; a child snapshot pins them again, so the blocks of committed snapshots are shared
//! until a writer clones them.

use fxhash::FxHashMap;
use slab::Slab;

use crate::block::{Block, BlockHeader, BlockId, BlockUid, CacheGroup, ContainerId, SnapshotId};
use crate::error::{Error, Result};
use crate::metrics::{Metric, Metrics};
use crate::node::{self, blob_type_hash, LeafLayout, NodeHeader, NodeKind, NodeRef};
use crate::options::{Options, MIN_BRANCH_CAPACITY, MIN_LEAF_CAPACITY};
use crate::tree::{Tree, TreeReader};

mod snapshot;
mod verify;

pub use snapshot::ContainerRoot;
use snapshot::SnapshotState;

/// Entry limits of the nodes of one container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capacities {
    pub leaf: usize,
    pub branch: usize,
}

impl Capacities {
    /// The capacity of a node at `level`.
    pub fn at_level(&self, level: usize) -> usize {
        if level == 0 {
            self.leaf
        } else {
            self.branch
        }
    }
}

/// The store of blocks, snapshots and containers.
pub struct BlockStore {
    options: Options,
    branch_capacity: usize,
    leaf_capacities: [usize; 3],
    blocks: Slab<Block>,
    next_uid: u64,
    next_snapshot: u64,
    lsn: u64,
    snapshots: FxHashMap<SnapshotId, SnapshotState>,
    metrics: Metrics,
}

impl BlockStore {
    /// Create an empty store.
    pub fn open(options: Options) -> Result<Self> {
        options.validate().map_err(Error::InvalidOptions)?;

        let payload = options.payload_size();
        let limit = |configured: Option<usize>, physical: usize, min: usize| -> Result<usize> {
            if physical < min {
                return Err(Error::InvalidOptions(format!(
                    "blocks of {} bytes hold fewer than {min} entries",
                    options.block_size
                )));
            }
            Ok(configured.map_or(physical, |c| c.min(physical)))
        };
        let branch_capacity = limit(
            options.branch_capacity,
            node::physical_capacity(NodeKind::Branch, payload),
            MIN_BRANCH_CAPACITY,
        )?;
        let mut leaf_capacities = [0; 3];
        for (i, layout) in LeafLayout::ALL.into_iter().enumerate() {
            leaf_capacities[i] = limit(
                options.leaf_capacity,
                node::physical_capacity(NodeKind::Leaf(layout), payload),
                MIN_LEAF_CAPACITY,
            )?;
        }

        tracing::debug!(
            block_size = options.block_size,
            branch_capacity,
            ?leaf_capacities,
            "opened block store"
        );

        Ok(BlockStore {
            metrics: Metrics::new(options.metrics),
            options,
            branch_capacity,
            leaf_capacities,
            blocks: Slab::new(),
            next_uid: 1,
            next_snapshot: 1,
            lsn: 0,
            snapshots: FxHashMap::default(),
        })
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Entry limits of the nodes of containers with `layout`.
    pub fn capacities(&self, layout: LeafLayout) -> Capacities {
        let leaf = match layout {
            LeafLayout::Sequence => self.leaf_capacities[0],
            LeafLayout::Map => self.leaf_capacities[1],
            LeafLayout::Blob => self.leaf_capacities[2],
        };
        Capacities {
            leaf,
            branch: self.branch_capacity,
        }
    }

    /// The largest blob a single blob block holds.
    pub fn max_blob_len(&self) -> usize {
        self.options.payload_size() - BLOB_HEADER_SIZE
    }

    /// Number of live blocks.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn get_block(&self, id: BlockId) -> Result<&Block> {
        self.blocks.get(id.key()).ok_or(Error::BlockNotFound(id))
    }

    pub(crate) fn block_mut(&mut self, id: BlockId) -> Result<&mut Block> {
        self.blocks.get_mut(id.key()).ok_or(Error::BlockNotFound(id))
    }

    /// Two distinct blocks, mutably.
    pub(crate) fn pair_mut(&mut self, a: BlockId, b: BlockId) -> Result<(&mut Block, &mut Block)> {
        assert_ne!(a, b);
        if !self.blocks.contains(a.key()) {
            return Err(Error::BlockNotFound(a));
        }
        self.blocks
            .get2_mut(a.key(), b.key())
            .ok_or(Error::BlockNotFound(b))
    }

    fn next_lsn(&mut self) -> u64 {
        self.lsn += 1;
        self.lsn
    }

    fn allocate(
        &mut self,
        snapshot: SnapshotId,
        cache_group: CacheGroup,
        ctr_type_hash: u64,
        block_type_hash: u64,
    ) -> Result<&mut Block> {
        let uid = BlockUid(self.next_uid);
        self.next_uid += 1;
        let lsn = self.next_lsn();

        let entry = self.blocks.vacant_entry();
        let id = BlockId::from_key(entry.key());
        let mut header = BlockHeader::new(
            id,
            uid,
            snapshot,
            self.options.block_size as u32,
            cache_group,
        );
        header.ctr_type_hash = ctr_type_hash;
        header.block_type_hash = block_type_hash;
        header.log_sequence_number = lsn;
        Ok(entry.insert(Block::new(header)?))
    }

    /// Create an empty node owned by `snapshot`, with no references.
    pub(crate) fn create_node(
        &mut self,
        snapshot: SnapshotId,
        ctr_type_hash: u64,
        header: NodeHeader,
    ) -> Result<BlockId> {
        let cache_group = node_cache_group(header.root, header.kind);
        let block = self.allocate(
            snapshot,
            cache_group,
            ctr_type_hash,
            header.kind.block_type_hash(),
        )?;
        node::init(block.payload_mut(), header)
            .map_err(|e| Error::structural(format!("empty node does not fit: {e}")))?;
        let id = block.id();
        tracing::trace!(%id, kind = ?header.kind, level = header.level, "created node");
        Ok(id)
    }

    /// Set or clear the root role of a node, moving it to the matching cache group.
    pub(crate) fn set_root_flag(&mut self, id: BlockId, root: bool) -> Result<()> {
        let block = self.block_mut(id)?;
        let kind = NodeHeader::decode(block.payload())?.kind;
        node::set_root(block.payload_mut(), root);
        let group = node_cache_group(root, kind);
        let header = block.header_mut();
        header.cache_group = group;
        header.cache_priority = group.priority();
        Ok(())
    }

    /// Create a blob block holding `data`, with no references.
    pub(crate) fn create_blob(
        &mut self,
        snapshot: SnapshotId,
        ctr_type_hash: u64,
        data: &[u8],
    ) -> Result<BlockId> {
        let max = self.max_blob_len();
        if data.len() > max {
            return Err(Error::BlobTooLarge {
                len: data.len(),
                max,
            });
        }
        let block =
            self.allocate(snapshot, CacheGroup::Payload, ctr_type_hash, blob_type_hash())?;
        let payload = block.payload_mut();
        payload[0..8].copy_from_slice(&(data.len() as u64).to_le_bytes());
        payload[BLOB_HEADER_SIZE..BLOB_HEADER_SIZE + data.len()].copy_from_slice(data);
        Ok(block.id())
    }

    /// The bytes kept in a blob block.
    pub fn blob_data(&self, id: BlockId) -> Result<&[u8]> {
        let block = self.get_block(id)?;
        if block.header().block_type_hash != blob_type_hash() {
            return Err(Error::structural(format!("block {id} is not a blob")));
        }
        let payload = block.payload();
        // UNWRAP: the payload is never shorter than a blob header.
        let len = u64::from_le_bytes(payload[0..8].try_into().unwrap()) as usize;
        payload
            .get(BLOB_HEADER_SIZE..BLOB_HEADER_SIZE + len)
            .ok_or_else(|| Error::structural(format!("blob {id} claims {len} bytes")))
    }

    /// Copy a block into a new block owned by `snapshot`.
    ///
    /// The copy starts without references. Pointers stored in its payload are copied as they
    /// are; the caller accounts for them.
    pub fn clone_block(&mut self, id: BlockId, snapshot: SnapshotId) -> Result<BlockId> {
        let source = self.get_block(id)?.clone();
        let uid = BlockUid(self.next_uid);
        self.next_uid += 1;
        let lsn = self.next_lsn();

        let entry = self.blocks.vacant_entry();
        let new_id = BlockId::from_key(entry.key());
        let mut block = source;
        {
            let header = block.header_mut();
            header.id = new_id;
            header.uid = uid;
            header.snapshot_id = snapshot;
            header.log_sequence_number = lsn;
            header.reset_references();
        }
        entry.insert(block);

        self.metrics.count(Metric::BlockClones);
        tracing::debug!(from = %id, to = %new_id, %snapshot, "cloned block");
        Ok(new_id)
    }

    /// Add a reference to a block. Returns the new count.
    pub fn ref_block(&mut self, id: BlockId) -> Result<i64> {
        let references = self.get_block(id)?.header().add_reference();
        tracing::trace!(%id, references, "ref");
        Ok(references)
    }

    /// Drop a reference to a block.
    ///
    /// Returns `true` exactly when the count reached zero: the block is then eligible for
    /// removal. Panics if the count was not positive.
    pub fn unref_block(&mut self, id: BlockId) -> Result<bool> {
        let released = self.get_block(id)?.header().release_reference();
        tracing::trace!(%id, released, "unref");
        Ok(released)
    }

    /// Remove an unreferenced block.
    pub fn remove_block(&mut self, id: BlockId) -> Result<()> {
        let references = self.get_block(id)?.references();
        if references != 0 {
            return Err(Error::BlockInUse { id, references });
        }
        self.blocks.remove(id.key());
        self.metrics.count(Metric::BlocksFreed);
        tracing::trace!(%id, "removed block");
        Ok(())
    }

    /// Blocks referenced from the payload of `id`.
    pub fn references_of(&self, id: BlockId) -> Result<Vec<BlockId>> {
        let block = self.get_block(id)?;
        if block.header().block_type_hash == blob_type_hash() {
            return Ok(Vec::new());
        }
        let (_, node) = NodeRef::open(block.payload())?;
        Ok(node.references())
    }

    /// Drop a reference and, if it was the last one, release everything the block points to
    /// before removing it.
    pub fn unref_cascade(&mut self, id: BlockId) -> Result<()> {
        if !self.unref_block(id)? {
            return Ok(());
        }
        for child in self.references_of(id)? {
            self.unref_cascade(child)?;
        }
        self.remove_block(id)
    }

    fn snapshot(&self, snapshot: SnapshotId) -> Result<&SnapshotState> {
        self.snapshots
            .get(&snapshot)
            .ok_or(Error::SnapshotNotFound(snapshot))
    }

    fn writable(&mut self, snapshot: SnapshotId) -> Result<&mut SnapshotState> {
        let state = self
            .snapshots
            .get_mut(&snapshot)
            .ok_or(Error::SnapshotNotFound(snapshot))?;
        if state.committed {
            return Err(Error::SnapshotCommitted(snapshot));
        }
        Ok(state)
    }

    /// Start a writable snapshot, empty or branched from a committed `parent`.
    pub fn create_snapshot(&mut self, parent: Option<SnapshotId>) -> Result<SnapshotId> {
        let id = SnapshotId(self.next_snapshot);
        let state = match parent {
            None => SnapshotState::new(None),
            Some(parent) => {
                let parent_state = self.snapshot(parent)?;
                if !parent_state.committed {
                    return Err(Error::SnapshotNotCommitted(parent));
                }
                parent_state.branch(parent)
            }
        };
        for root in state.roots() {
            self.get_block(root)?.header().add_reference();
        }
        self.next_snapshot += 1;
        self.snapshots.insert(id, state);
        tracing::debug!(snapshot = %id, ?parent, "created snapshot");
        Ok(id)
    }

    /// Freeze a snapshot. Its blocks become immutable and it can be branched.
    pub fn commit(&mut self, snapshot: SnapshotId) -> Result<()> {
        self.writable(snapshot)?.committed = true;
        tracing::debug!(%snapshot, "committed snapshot");
        Ok(())
    }

    /// Forget a snapshot, releasing its roots.
    pub fn drop_snapshot(&mut self, snapshot: SnapshotId) -> Result<()> {
        let state = self
            .snapshots
            .remove(&snapshot)
            .ok_or(Error::SnapshotNotFound(snapshot))?;
        for root in state.roots() {
            self.unref_cascade(root)?;
        }
        tracing::debug!(%snapshot, blocks = self.blocks.len(), "dropped snapshot");
        Ok(())
    }

    pub fn snapshots(&self) -> Vec<SnapshotId> {
        let mut ids: Vec<_> = self.snapshots.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn is_committed(&self, snapshot: SnapshotId) -> Result<bool> {
        Ok(self.snapshot(snapshot)?.committed)
    }

    pub fn parent_of(&self, snapshot: SnapshotId) -> Result<Option<SnapshotId>> {
        Ok(self.snapshot(snapshot)?.parent)
    }

    /// Create an empty container in a writable snapshot.
    pub fn create_container(
        &mut self,
        snapshot: SnapshotId,
        container: ContainerId,
        layout: LeafLayout,
    ) -> Result<()> {
        if self.writable(snapshot)?.containers.contains_key(&container) {
            return Err(Error::ContainerExists {
                snapshot,
                container,
            });
        }
        let root = self.create_node(
            snapshot,
            layout.ctr_type_hash(),
            NodeHeader {
                kind: NodeKind::Leaf(layout),
                level: 0,
                root: true,
            },
        )?;
        self.ref_block(root)?;
        self.writable(snapshot)?
            .containers
            .insert(container, ContainerRoot { root, layout });
        tracing::debug!(%snapshot, %container, ?layout, "created container");
        Ok(())
    }

    /// Remove a container from a writable snapshot, releasing its tree.
    pub fn remove_container(&mut self, snapshot: SnapshotId, container: ContainerId) -> Result<()> {
        let removed = self
            .writable(snapshot)?
            .containers
            .remove(&container)
            .ok_or(Error::ContainerNotFound {
                snapshot,
                container,
            })?;
        self.unref_cascade(removed.root)
    }

    /// The containers of a snapshot, in ID order.
    pub fn containers(&self, snapshot: SnapshotId) -> Result<Vec<(ContainerId, LeafLayout)>> {
        Ok(self
            .snapshot(snapshot)?
            .containers
            .iter()
            .map(|(id, c)| (*id, c.layout))
            .collect())
    }

    pub fn container_root(
        &self,
        snapshot: SnapshotId,
        container: ContainerId,
    ) -> Result<ContainerRoot> {
        self.snapshot(snapshot)?
            .containers
            .get(&container)
            .copied()
            .ok_or(Error::ContainerNotFound {
                snapshot,
                container,
            })
    }

    /// Point a container at a new root block. References are the caller's business.
    pub(crate) fn set_container_root(
        &mut self,
        snapshot: SnapshotId,
        container: ContainerId,
        root: BlockId,
    ) -> Result<()> {
        let state = self.writable(snapshot)?;
        match state.containers.get_mut(&container) {
            Some(c) => {
                c.root = root;
                Ok(())
            }
            None => Err(Error::ContainerNotFound {
                snapshot,
                container,
            }),
        }
    }

    /// Open a container of a writable snapshot for updates.
    pub fn tree(&mut self, snapshot: SnapshotId, container: ContainerId) -> Result<Tree<'_>> {
        self.writable(snapshot)?;
        let root = self.container_root(snapshot, container)?;
        let capacities = self.capacities(root.layout);
        Ok(Tree::new(self, snapshot, container, root, capacities))
    }

    /// Run `f` on a container of a writable snapshot, keeping its changes only if it succeeds.
    ///
    /// `f` runs against a scratch snapshot sharing the container's tree, so every node it
    /// touches is cloned first and the nodes of `snapshot` stay as they are. On success the
    /// container moves to the scratch tree and `snapshot` adopts the clones. On failure the
    /// scratch tree is released.
    pub fn update<R>(
        &mut self,
        snapshot: SnapshotId,
        container: ContainerId,
        f: impl FnOnce(&mut Tree<'_>) -> Result<R>,
    ) -> Result<R> {
        self.writable(snapshot)?;
        let original = self.container_root(snapshot, container)?;

        let scratch = SnapshotId(self.next_snapshot);
        self.next_snapshot += 1;
        let mut state = SnapshotState::new(Some(snapshot));
        state.containers.insert(container, original);
        self.ref_block(original.root)?;
        self.snapshots.insert(scratch, state);

        let outcome = self
            .tree(scratch, container)
            .and_then(|mut tree| f(&mut tree));

        let state = self
            .snapshots
            .remove(&scratch)
            .ok_or(Error::SnapshotNotFound(scratch))?;
        let root = state
            .containers
            .get(&container)
            .ok_or(Error::ContainerNotFound {
                snapshot: scratch,
                container,
            })?
            .root;

        match outcome {
            Ok(output) => {
                self.adopt(root, scratch, snapshot)?;
                self.set_container_root(snapshot, container, root)?;
                self.unref_cascade(original.root)?;
                Ok(output)
            }
            Err(e) => {
                self.unref_cascade(root)?;
                tracing::debug!(%snapshot, %container, error = %e, "discarded failed update");
                Err(e)
            }
        }
    }

    /// Hand the blocks of `from` reachable from `root` over to `to`.
    ///
    /// Blocks of `from` are only reachable through other blocks of `from`, so the walk stops at
    /// the first block owned by another snapshot.
    fn adopt(&mut self, root: BlockId, from: SnapshotId, to: SnapshotId) -> Result<()> {
        let mut pending = vec![root];
        while let Some(id) = pending.pop() {
            let block = self.block_mut(id)?;
            if block.snapshot_id() != from {
                continue;
            }
            block.header_mut().snapshot_id = to;
            pending.extend(self.references_of(id)?);
        }
        Ok(())
    }

    /// Open a container of any snapshot for reading.
    pub fn reader(&self, snapshot: SnapshotId, container: ContainerId) -> Result<TreeReader<'_>> {
        let root = self.container_root(snapshot, container)?;
        Ok(TreeReader::new(self, root))
    }
}

/// Bytes in front of the data of a blob block: its length.
const BLOB_HEADER_SIZE: usize = 8;

fn node_cache_group(root: bool, kind: NodeKind) -> CacheGroup {
    match (root, kind) {
        (true, _) => CacheGroup::Root,
        (false, NodeKind::Branch) => CacheGroup::Branch,
        (false, NodeKind::Leaf(_)) => CacheGroup::Leaf,
    }
}

#[cfg(test)]
mod tests;
