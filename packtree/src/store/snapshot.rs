use crate::block::{BlockId, ContainerId, SnapshotId};
use crate::node::LeafLayout;

/// Where a container's tree starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerRoot {
    pub root: BlockId,
    pub layout: LeafLayout,
}

/// The state of one snapshot.
///
/// Branching a snapshot copies the container map, which is a persistent map so the copy is
/// cheap and the two evolve independently.
#[derive(Debug, Clone)]
pub(crate) struct SnapshotState {
    pub parent: Option<SnapshotId>,
    pub committed: bool,
    pub containers: imbl::OrdMap<ContainerId, ContainerRoot>,
}

impl SnapshotState {
    pub fn new(parent: Option<SnapshotId>) -> Self {
        SnapshotState {
            parent,
            committed: false,
            containers: imbl::OrdMap::new(),
        }
    }

    /// A writable child of this snapshot, sharing its containers.
    pub fn branch(&self, parent: SnapshotId) -> Self {
        SnapshotState {
            parent: Some(parent),
            committed: false,
            containers: self.containers.clone(),
        }
    }

    pub fn roots(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.containers.values().map(|c| c.root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_is_independent() {
        let mut parent = SnapshotState::new(None);
        parent.containers.insert(
            ContainerId(1),
            ContainerRoot {
                root: BlockId(1),
                layout: LeafLayout::Map,
            },
        );
        parent.committed = true;

        let mut child = parent.branch(SnapshotId(1));
        assert!(!child.committed);
        child.containers.insert(
            ContainerId(1),
            ContainerRoot {
                root: BlockId(2),
                layout: LeafLayout::Map,
            },
        );
        assert_eq!(parent.roots().collect::<Vec<_>>(), vec![BlockId(1)]);
        assert_eq!(child.roots().collect::<Vec<_>>(), vec![BlockId(2)]);
    }
}
