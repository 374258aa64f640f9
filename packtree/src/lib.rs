//! Copy-on-write balanced trees over fixed-size packed blocks.
//!
//! A [`BlockStore`] keeps blocks, snapshots and containers. A snapshot is a mutation epoch:
//! while writable, the nodes it owns are edited in place, once committed it is frozen and may
//! be branched into new writable snapshots that share its nodes until they edit them. A
//! container is one tree within a snapshot, with leaves in one of the [`LeafLayout`]s:
//! plain values, sparse maps keyed by `u64` or blobs.
//!
//! ```
//! use packtree::{BlockStore, ContainerId, FindOps, InsertOps, LeafLayout, Options};
//!
//! let mut store = BlockStore::open(Options::new()).unwrap();
//! let s = store.create_snapshot(None).unwrap();
//! store.create_container(s, ContainerId(1), LeafLayout::Map).unwrap();
//!
//! let mut tree = store.tree(s, ContainerId(1)).unwrap();
//! tree.map_insert(42, Some(7)).unwrap();
//! assert_eq!(tree.map_get(42).unwrap(), Some(Some(7)));
//! ```
//!
//! [`Db`] shares a store between threads.

pub mod block;
pub mod error;
pub mod metrics;
pub mod node;
pub mod options;
pub mod store;
pub mod tree;

mod db;

#[cfg(feature = "benchmarks")]
pub mod benches;

pub use packtree_core::Accumulator;

pub use block::{BlockId, ContainerId, SnapshotId};
pub use db::{Db, StoreReadGuard};
pub use error::{Error, Result};
pub use metrics::{Metric, Metrics};
pub use node::LeafLayout;
pub use options::Options;
pub use store::{BlockStore, Capacities};
pub use tree::{
    CowOps, FindOps, InsertOps, Item, Iter, MergeScope, ReadContext, RemoveOps, Tree,
    TreeContext, TreeReader, MAX_SUM,
};
