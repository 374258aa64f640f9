use packtree_core::packed::{OutOfBlockSpace, PackedError};

use crate::block::{BlockId, ContainerId, SnapshotId};
use crate::node::{LeafLayout, NodeKind};

/// Errors surfaced by the block store and the tree engine.
///
/// Lack of space inside a node is not among them: it is reported as [`CapacityExceeded`] by
/// node-level edits and always handled by splitting.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A block ID does not name a live block.
    #[error("block {0} not found")]
    BlockNotFound(BlockId),

    /// A block is still referenced and cannot be removed.
    #[error("block {id} still has {references} references")]
    BlockInUse {
        /// The block.
        id: BlockId,
        /// Its reference count.
        references: i64,
    },

    #[error("snapshot {0} not found")]
    SnapshotNotFound(SnapshotId),

    /// Updates were attempted on a committed snapshot.
    #[error("snapshot {0} is committed")]
    SnapshotCommitted(SnapshotId),

    /// A snapshot can only be branched once it is committed.
    #[error("snapshot {0} is not committed")]
    SnapshotNotCommitted(SnapshotId),

    #[error("container {container} not found in snapshot {snapshot}")]
    ContainerNotFound {
        snapshot: SnapshotId,
        container: ContainerId,
    },

    #[error("container {container} already exists in snapshot {snapshot}")]
    ContainerExists {
        snapshot: SnapshotId,
        container: ContainerId,
    },

    /// A node owned by another snapshot was about to be mutated in place.
    #[error("block {block} belongs to snapshot {owner}, active snapshot is {active}")]
    ImmutableNode {
        block: BlockId,
        owner: SnapshotId,
        active: SnapshotId,
    },

    /// A position lies outside the container.
    #[error("position {position} out of bounds, size is {size}")]
    OutOfBounds { position: u64, size: u64 },

    /// An operation for one leaf layout was called on a container of another.
    #[error("operation expects {expected:?} leaves, container has {actual:?}")]
    LayoutMismatch {
        expected: LeafLayout,
        actual: LeafLayout,
    },

    /// A block does not hold the kind of node expected at this place in the tree.
    #[error("block {block}: expected {expected:?}, found {found:?}")]
    UnexpectedNode {
        block: BlockId,
        expected: NodeKind,
        found: NodeKind,
    },

    /// An indexed value or map key would take the sum of a container past its limit.
    #[error("value {value} would take the container sum past {max}")]
    ValueOutOfRange { value: u64, max: u64 },

    /// A blob does not fit in one block.
    #[error("blob of {len} bytes exceeds the limit of {max}")]
    BlobTooLarge { len: usize, max: usize },

    #[error("invalid options: {0}")]
    InvalidOptions(String),

    /// The tree or one of its blocks violates a structural invariant.
    #[error("structural violation: {0}")]
    Structural(String),

    #[error(transparent)]
    Packed(#[from] PackedError),
}

impl Error {
    pub(crate) fn structural(msg: impl Into<String>) -> Self {
        Error::Structural(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// A node-level edit did not fit into its node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("node capacity exceeded")]
pub struct CapacityExceeded;

impl From<OutOfBlockSpace> for CapacityExceeded {
    fn from(_: OutOfBlockSpace) -> Self {
        CapacityExceeded
    }
}
