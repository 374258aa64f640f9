//! A shareable handle over a [`BlockStore`].

use std::sync::Arc;

use parking_lot::{ArcRwLockReadGuard, RawRwLock, RwLock};

use crate::block::{ContainerId, SnapshotId};
use crate::error::Result;
use crate::metrics::Metrics;
use crate::node::LeafLayout;
use crate::options::Options;
use crate::store::BlockStore;
use crate::tree::{Tree, TreeReader};

/// A block store behind a reader-writer lock, cheap to clone and share across threads.
///
/// Readers of any snapshot run concurrently. Updates take the store exclusively for the length
/// of one closure, and a closure's changes are kept only if it returns `Ok`, so readers see
/// every update in full or not at all.
#[derive(Clone)]
pub struct Db {
    shared: Arc<RwLock<BlockStore>>,
}

/// A read guard over the store which owns its handle on the lock.
pub type StoreReadGuard = ArcRwLockReadGuard<RawRwLock, BlockStore>;

impl Db {
    pub fn open(options: Options) -> Result<Self> {
        let store = BlockStore::open(options)?;
        Ok(Db {
            shared: Arc::new(RwLock::new(store)),
        })
    }

    /// Run `f` with shared access to the store.
    pub fn read<R>(&self, f: impl FnOnce(&BlockStore) -> R) -> R {
        f(&self.shared.read())
    }

    /// Run `f` with exclusive access to the store.
    pub fn write<R>(&self, f: impl FnOnce(&mut BlockStore) -> R) -> R {
        f(&mut self.shared.write())
    }

    /// Shared access to the store that can be moved to another thread.
    pub fn read_arc(&self) -> StoreReadGuard {
        RwLock::read_arc(&self.shared)
    }

    /// Update one container of a writable snapshot. See [`BlockStore::update`].
    pub fn update<R>(
        &self,
        snapshot: SnapshotId,
        container: ContainerId,
        f: impl FnOnce(&mut Tree<'_>) -> Result<R>,
    ) -> Result<R> {
        self.shared.write().update(snapshot, container, f)
    }

    /// Read one container of any snapshot.
    pub fn view<R>(
        &self,
        snapshot: SnapshotId,
        container: ContainerId,
        f: impl FnOnce(&TreeReader<'_>) -> Result<R>,
    ) -> Result<R> {
        let store = self.shared.read();
        let reader = store.reader(snapshot, container)?;
        f(&reader)
    }

    pub fn create_snapshot(&self, parent: Option<SnapshotId>) -> Result<SnapshotId> {
        self.shared.write().create_snapshot(parent)
    }

    pub fn commit(&self, snapshot: SnapshotId) -> Result<()> {
        self.shared.write().commit(snapshot)
    }

    pub fn drop_snapshot(&self, snapshot: SnapshotId) -> Result<()> {
        self.shared.write().drop_snapshot(snapshot)
    }

    pub fn create_container(
        &self,
        snapshot: SnapshotId,
        container: ContainerId,
        layout: LeafLayout,
    ) -> Result<()> {
        self.shared
            .write()
            .create_container(snapshot, container, layout)
    }

    pub fn remove_container(&self, snapshot: SnapshotId, container: ContainerId) -> Result<()> {
        self.shared.write().remove_container(snapshot, container)
    }

    pub fn metrics(&self) -> Metrics {
        self.shared.read().metrics().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{FindOps, InsertOps, Item};

    #[test]
    fn guards_outlive_the_handle() {
        let db = Db::open(Options::new()).unwrap();
        let s = db.create_snapshot(None).unwrap();
        db.create_container(s, ContainerId(7), LeafLayout::Sequence)
            .unwrap();
        db.update(s, ContainerId(7), |t| t.push_value(42)).unwrap();

        let guard = db.read_arc();
        drop(db);
        let reader = guard.reader(s, ContainerId(7)).unwrap();
        assert_eq!(reader.get(0).unwrap(), Item::Value(42));
    }

    #[test]
    fn updates_run_against_writable_snapshots_only() {
        let db = Db::open(Options::new()).unwrap();
        let s = db.create_snapshot(None).unwrap();
        db.create_container(s, ContainerId(1), LeafLayout::Map).unwrap();
        db.commit(s).unwrap();
        assert!(db
            .update(s, ContainerId(1), |t| t.map_insert(1, None))
            .is_err());
        assert_eq!(db.view(s, ContainerId(1), |r| r.len()).unwrap(), 0);
    }
}
