mod common;

use common::{keys, Test};
use packtree::{FindOps, InsertOps, LeafLayout, Metric, ReadContext, RemoveOps};

#[test]
fn insert_split_branch_and_merge() {
    let mut t = Test::new(LeafLayout::Map, 2, 4);

    {
        let mut tree = t.tree();
        for key in [5, 1, 3] {
            assert_eq!(tree.map_insert(key, Some(key * 10)).unwrap(), None);
        }
        assert_eq!(tree.height().unwrap(), 2);
    }
    assert_eq!(keys(&t.reader(t.snapshot)), vec![1, 3, 5]);
    assert_eq!(t.store.metrics().get(Metric::NodeSplits), 1);
    t.verify(t.snapshot);

    let s1 = t.branch();
    let s2 = t.snapshot;

    // clone the path to the leaf holding 5.
    assert_eq!(t.tree().map_insert(5, Some(500)).unwrap(), Some(Some(50)));
    assert_eq!(keys(&t.reader(s1)), vec![1, 3, 5]);
    assert_eq!(t.reader(s1).map_get(5).unwrap(), Some(Some(50)));
    assert_eq!(t.reader(s2).map_get(5).unwrap(), Some(Some(500)));

    let merges = t.store.metrics().get(Metric::NodeMerges);
    assert_eq!(t.tree().map_remove(3).unwrap(), Some(Some(30)));
    assert_eq!(t.store.metrics().get(Metric::NodeMerges), merges + 1);

    assert_eq!(keys(&t.reader(s2)), vec![1, 5]);
    assert_eq!(t.reader(s2).height().unwrap(), 1);
    assert_eq!(keys(&t.reader(s1)), vec![1, 3, 5]);
    t.verify(s1);
    t.verify(s2);

    t.store.drop_snapshot(s2).unwrap();
    t.verify(s1);
    t.store.drop_snapshot(s1).unwrap();
    assert_eq!(t.store.block_count(), 0);
}

#[test]
fn appends_split_to_the_right() {
    let mut t = Test::new(LeafLayout::Sequence, 2, 4);
    let mut tree = t.tree();
    for v in [1, 2, 3] {
        tree.push_value(v).unwrap();
    }
    // [1] [2, 3]: the appended element went into the new right sibling.
    let path = tree.find_position(2).unwrap().path;
    assert_eq!(tree.open_leaf(path.leaf()).unwrap().size(), 2);
    assert_eq!(path.parent_idx(0), 1);
}

#[test]
fn value_edits_in_a_full_leaf_do_not_split() {
    let mut t = Test::new(LeafLayout::Map, 2, 4);
    let mut tree = t.tree();
    tree.map_insert(10, None).unwrap();
    tree.map_insert(20, None).unwrap();
    tree.map_insert(30, Some(1)).unwrap();

    // the leaf [20, 30] is edited in place without a split.
    let splits = tree.store().metrics().get(Metric::NodeSplits);
    tree.map_insert(20, Some(2)).unwrap();
    assert_eq!(tree.store().metrics().get(Metric::NodeSplits), splits);
    let located = tree.find_key(20).unwrap();
    assert_eq!(located.path.parent_idx(0), 1);
    assert_eq!(located.idx, 0);
}
