use anyhow::{ensure, Result};
use fxhash::FxHashMap;

use super::BlockStore;
use crate::block::BlockId;

impl BlockStore {
    /// Recompute every reference count from snapshot roots and the pointers stored in blocks,
    /// and compare it with the count kept in the block header.
    ///
    /// Fails on the first block whose count disagrees, on dangling pointers and on blocks no
    /// pointer reaches.
    pub fn verify_refcounts(&self) -> Result<()> {
        let mut pointers: FxHashMap<BlockId, i64> = FxHashMap::default();

        for (snapshot, state) in &self.snapshots {
            for root in state.roots() {
                ensure!(
                    self.blocks.contains(root.key()),
                    "snapshot {snapshot} points at missing block {root}"
                );
                *pointers.entry(root).or_default() += 1;
            }
        }

        for (key, block) in self.blocks.iter() {
            let id = BlockId::from_key(key);
            ensure!(
                block.id() == id,
                "block in slot {key} believes it is {}",
                block.id()
            );
            for child in self.references_of(id)? {
                ensure!(
                    self.blocks.contains(child.key()),
                    "block {id} points at missing block {child}"
                );
                *pointers.entry(child).or_default() += 1;
            }
        }

        for (key, block) in self.blocks.iter() {
            let id = BlockId::from_key(key);
            let expected = pointers.get(&id).copied().unwrap_or(0);
            ensure!(
                block.references() == expected,
                "block {id} counts {} references but {expected} pointers reach it",
                block.references()
            );
            ensure!(expected > 0, "block {id} is unreachable");
        }
        Ok(())
    }
}
