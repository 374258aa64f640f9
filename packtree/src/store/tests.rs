use super::*;
use crate::tree::{FindOps, InsertOps, Item};

fn store() -> BlockStore {
    let mut options = Options::new();
    options.block_size(1024);
    options.metrics(true);
    BlockStore::open(options).unwrap()
}

fn leaf_header(root: bool) -> NodeHeader {
    NodeHeader {
        kind: NodeKind::Leaf(LeafLayout::Sequence),
        level: 0,
        root,
    }
}

#[test]
fn clone_copies_payload_with_fresh_identity() {
    let mut store = store();
    let s1 = store.create_snapshot(None).unwrap();
    let a = store
        .create_node(s1, LeafLayout::Sequence.ctr_type_hash(), leaf_header(true))
        .unwrap();
    store.ref_block(a).unwrap();

    let s2 = SnapshotId(99);
    let b = store.clone_block(a, s2).unwrap();
    assert_ne!(a, b);

    let (ba, bb) = (store.get_block(a).unwrap(), store.get_block(b).unwrap());
    assert_eq!(ba.payload(), bb.payload());
    assert_ne!(ba.header().uid, bb.header().uid);
    assert_eq!(bb.snapshot_id(), s2);
    assert_eq!(bb.references(), 0);
    assert_eq!(ba.references(), 1);
    assert_eq!(bb.header().block_type_hash, ba.header().block_type_hash);
    assert!(bb.header().log_sequence_number > ba.header().log_sequence_number);
    assert_eq!(store.metrics().get(Metric::BlockClones), 1);
}

#[test]
fn unref_reports_last_reference_once() {
    let mut store = store();
    let s = store.create_snapshot(None).unwrap();
    let a = store
        .create_node(s, LeafLayout::Sequence.ctr_type_hash(), leaf_header(false))
        .unwrap();
    store.ref_block(a).unwrap();
    store.ref_block(a).unwrap();

    assert!(matches!(
        store.remove_block(a),
        Err(Error::BlockInUse { references: 2, .. })
    ));
    assert!(!store.unref_block(a).unwrap());
    assert!(store.unref_block(a).unwrap());
    store.remove_block(a).unwrap();
    assert!(matches!(store.get_block(a), Err(Error::BlockNotFound(_))));
    assert_eq!(store.metrics().get(Metric::BlocksFreed), 1);
}

#[test]
#[should_panic]
fn unref_of_unreferenced_block_panics() {
    let mut store = store();
    let s = store.create_snapshot(None).unwrap();
    let a = store
        .create_node(s, LeafLayout::Sequence.ctr_type_hash(), leaf_header(false))
        .unwrap();
    let _ = store.unref_block(a);
}

#[test]
fn cascade_releases_children_and_blobs() {
    let mut store = store();
    let s = store.create_snapshot(None).unwrap();
    let ctr = LeafLayout::Blob.ctr_type_hash();

    let blob = store.create_blob(s, ctr, b"hello").unwrap();
    assert_eq!(store.blob_data(blob).unwrap(), b"hello");

    let leaf = store
        .create_node(
            s,
            ctr,
            NodeHeader {
                kind: NodeKind::Leaf(LeafLayout::Blob),
                level: 0,
                root: false,
            },
        )
        .unwrap();
    {
        let block = store.block_mut(leaf).unwrap();
        let node::NodeMut::Leaf(mut l) = node::NodeMut::open(block.payload_mut()).unwrap() else {
            panic!("not a leaf");
        };
        l.insert(0, &[node::LeafEntry::Blob { len: 5, block: blob }])
            .unwrap();
    }
    store.ref_block(blob).unwrap();

    let branch = store
        .create_node(
            s,
            ctr,
            NodeHeader {
                kind: NodeKind::Branch,
                level: 1,
                root: true,
            },
        )
        .unwrap();
    {
        let block = store.block_mut(branch).unwrap();
        let node::NodeMut::Branch(mut b) = node::NodeMut::open(block.payload_mut()).unwrap() else {
            panic!("not a branch");
        };
        b.insert(0, &[(leaf, packtree_core::Accumulator::new(1, 5))])
            .unwrap();
    }
    store.ref_block(leaf).unwrap();
    store.ref_block(branch).unwrap();
    assert_eq!(store.references_of(branch).unwrap(), vec![leaf]);
    assert_eq!(store.references_of(leaf).unwrap(), vec![blob]);
    assert_eq!(store.block_count(), 3);

    store.unref_cascade(branch).unwrap();
    assert_eq!(store.block_count(), 0);
}

#[test]
fn snapshots_pin_their_roots() {
    let mut store = store();
    let s1 = store.create_snapshot(None).unwrap();
    store
        .create_container(s1, ContainerId(1), LeafLayout::Map)
        .unwrap();
    assert!(matches!(
        store.create_container(s1, ContainerId(1), LeafLayout::Map),
        Err(Error::ContainerExists { .. })
    ));
    assert!(matches!(
        store.create_snapshot(Some(s1)),
        Err(Error::SnapshotNotCommitted(_))
    ));
    store.commit(s1).unwrap();
    assert!(matches!(
        store.create_container(s1, ContainerId(2), LeafLayout::Map),
        Err(Error::SnapshotCommitted(_))
    ));

    let s2 = store.create_snapshot(Some(s1)).unwrap();
    assert_eq!(store.parent_of(s2).unwrap(), Some(s1));
    let root = store.container_root(s2, ContainerId(1)).unwrap().root;
    assert_eq!(store.get_block(root).unwrap().references(), 2);
    store.verify_refcounts().unwrap();

    store.drop_snapshot(s1).unwrap();
    assert_eq!(store.get_block(root).unwrap().references(), 1);
    store.verify_refcounts().unwrap();

    store.remove_container(s2, ContainerId(1)).unwrap();
    assert_eq!(store.block_count(), 0);
    assert!(store.containers(s2).unwrap().is_empty());
    store.verify_refcounts().unwrap();
}

#[test]
fn verify_detects_leaked_reference() {
    let mut store = store();
    let s = store.create_snapshot(None).unwrap();
    store
        .create_container(s, ContainerId(7), LeafLayout::Sequence)
        .unwrap();
    let root = store.container_root(s, ContainerId(7)).unwrap().root;
    store.ref_block(root).unwrap();
    assert!(store.verify_refcounts().is_err());
    store.unref_block(root).unwrap();
    store.verify_refcounts().unwrap();
}

#[test]
fn oversized_blob_is_rejected() {
    let mut store = store();
    let s = store.create_snapshot(None).unwrap();
    let data = vec![1u8; store.max_blob_len() + 1];
    assert!(matches!(
        store.create_blob(s, 0, &data),
        Err(Error::BlobTooLarge { .. })
    ));
}

#[test]
fn capacities_respect_options() {
    let mut options = Options::new();
    options.leaf_capacity(2);
    options.branch_capacity(5);
    let store = BlockStore::open(options).unwrap();
    let caps = store.capacities(LeafLayout::Map);
    assert_eq!(caps.leaf, 2);
    assert_eq!(caps.branch, 5);
    assert_eq!(caps.at_level(0), 2);
    assert_eq!(caps.at_level(4), 5);

    let store = BlockStore::open(Options::new()).unwrap();
    let caps = store.capacities(LeafLayout::Sequence);
    assert!(caps.leaf > store.capacities(LeafLayout::Map).leaf);
}

#[test]
fn default_options_hold_multi_word_bitmaps() {
    let mut store = BlockStore::open(Options::new()).unwrap();
    // presence bits of map values span several 64-bit words.
    assert!(store.capacities(LeafLayout::Map).leaf > 128);

    let s = store.create_snapshot(None).unwrap();
    store
        .create_container(s, ContainerId(1), LeafLayout::Map)
        .unwrap();
    let mut tree = store.tree(s, ContainerId(1)).unwrap();
    for key in 0..200u64 {
        let value = (key % 3 != 0).then_some(key * 10);
        tree.map_insert(key, value).unwrap();
    }
    assert_eq!(tree.map_get(130).unwrap(), Some(Some(1300)));
    assert_eq!(tree.map_get(129).unwrap(), Some(None));
    tree.verify().unwrap();
}

fn sequence_of(store: &mut BlockStore, len: u64) -> SnapshotId {
    let s = store.create_snapshot(None).unwrap();
    store
        .create_container(s, ContainerId(1), LeafLayout::Sequence)
        .unwrap();
    store
        .update(s, ContainerId(1), |tree| {
            for v in 0..len {
                tree.push_value(v)?;
            }
            Ok(())
        })
        .unwrap();
    s
}

#[test]
fn failed_update_leaves_the_container_as_it_was() {
    let mut store = store();
    let s = sequence_of(&mut store, 100);
    let root = store.container_root(s, ContainerId(1)).unwrap().root;
    let blocks = store.block_count();

    let outcome = store.update(s, ContainerId(1), |tree| {
        tree.update_value(3, 1000)?;
        tree.push_value(7)?;
        tree.update_value(500, 0)
    });
    assert!(matches!(outcome, Err(Error::OutOfBounds { position: 500, .. })));

    assert_eq!(store.container_root(s, ContainerId(1)).unwrap().root, root);
    assert_eq!(store.block_count(), blocks);
    assert_eq!(store.snapshots(), vec![s]);
    let reader = store.reader(s, ContainerId(1)).unwrap();
    assert_eq!(reader.len().unwrap(), 100);
    assert_eq!(reader.get(3).unwrap(), Item::Value(3));
    reader.verify().unwrap();
    store.verify_refcounts().unwrap();
}

#[test]
fn successful_update_is_adopted_by_the_snapshot() {
    let mut store = store();
    let s = sequence_of(&mut store, 100);
    store.verify_refcounts().unwrap();

    let mut pending = vec![store.container_root(s, ContainerId(1)).unwrap().root];
    while let Some(id) = pending.pop() {
        assert_eq!(store.get_block(id).unwrap().snapshot_id(), s);
        pending.extend(store.references_of(id).unwrap());
    }

    // the adopted nodes are edited in place from now on.
    let clones = store.metrics().get(Metric::BlockClones);
    store
        .tree(s, ContainerId(1))
        .unwrap()
        .update_value(50, 0)
        .unwrap();
    assert_eq!(store.metrics().get(Metric::BlockClones), clones);
    assert_eq!(
        store.reader(s, ContainerId(1)).unwrap().get(50).unwrap(),
        Item::Value(0)
    );
}
