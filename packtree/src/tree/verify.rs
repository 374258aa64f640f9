//! Structural checks of a whole container.

use anyhow::{bail, ensure, Context, Result};
use packtree_core::Accumulator;

use super::FindOps;
use crate::block::BlockId;
use crate::node::{blob_type_hash, LeafEntry, LeafLayout, NodeKind, NodeRef};

pub(crate) fn verify_tree<C: FindOps + ?Sized>(ctx: &C) -> Result<()> {
    let root = ctx.root();
    let level = ctx.open_node(root)?.0.level as usize;
    verify_node(ctx, root, level, true)
        .with_context(|| format!("verifying tree under root {root}"))?;
    Ok(())
}

/// Check `id` and everything below it, returning its totals.
fn verify_node<C: FindOps + ?Sized>(
    ctx: &C,
    id: BlockId,
    level: usize,
    is_root: bool,
) -> Result<Accumulator> {
    let layout = ctx.layout();
    let block = ctx.store().get_block(id)?;
    let (header, node) = ctx.open_node(id)?;

    ensure!(
        header.level as usize == level,
        "block {id} at level {} where level {level} was expected",
        header.level
    );
    ensure!(header.root == is_root, "block {id} has root flag {}", header.root);
    let expected_kind = if level == 0 {
        NodeKind::Leaf(layout)
    } else {
        NodeKind::Branch
    };
    ensure!(
        header.kind == expected_kind,
        "block {id} is {:?} where {expected_kind:?} was expected",
        header.kind
    );
    ensure!(
        block.header().block_type_hash == expected_kind.block_type_hash(),
        "block {id} has a foreign block type hash"
    );
    ensure!(
        block.header().ctr_type_hash == layout.ctr_type_hash(),
        "block {id} has a foreign container type hash"
    );
    node.check()
        .map_err(|e| anyhow::anyhow!("block {id} fails its packed checks: {e}"))?;

    let size = node.size();
    let capacity = ctx.capacities().at_level(level);
    ensure!(size <= capacity, "block {id} holds {size} of {capacity} entries");
    if !is_root {
        ensure!(size > 0, "non-root block {id} is empty");
        ensure!(
            size >= capacity / 2,
            "non-root block {id} holds {size} of {capacity} entries"
        );
    }

    let totals = node.totals();
    match node {
        NodeRef::Branch(branch) => {
            for (idx, (child, recorded)) in branch.entries(0, size).into_iter().enumerate() {
                let actual = verify_node(ctx, child, level - 1, false)?;
                ensure!(
                    recorded == actual,
                    "entry {idx} of block {id} records {recorded:?}, child {child} has {actual:?}"
                );
            }
        }
        NodeRef::Leaf(leaf) => {
            for (idx, entry) in leaf.entries(0, size).into_iter().enumerate() {
                match entry {
                    LeafEntry::Key { delta, .. } => {
                        ensure!(layout == LeafLayout::Map, "map entry in block {id}");
                        // only the first key of the container may sit at 0.
                        if delta == 0 && (idx > 0 || leaf_has_keys_before(ctx, id)?) {
                            bail!("entry {idx} of block {id} repeats the previous key");
                        }
                    }
                    LeafEntry::Blob { len, block } => {
                        let blob = ctx.store().get_block(block)?;
                        ensure!(
                            blob.header().block_type_hash == blob_type_hash(),
                            "entry {idx} of block {id} points at non-blob block {block}"
                        );
                        let stored = ctx.store().blob_data(block)?.len() as u64;
                        ensure!(
                            stored == len,
                            "blob {block} holds {stored} bytes where {len} were recorded"
                        );
                    }
                    LeafEntry::Value(_) => {}
                }
            }
        }
    }
    Ok(totals)
}

/// Whether a map leaf is preceded by any key in its container.
fn leaf_has_keys_before<C: FindOps + ?Sized>(ctx: &C, leaf: BlockId) -> Result<bool> {
    let first = ctx.find_position(0)?;
    Ok(first.path.leaf() != leaf)
}
