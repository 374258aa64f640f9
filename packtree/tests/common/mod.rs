use packtree::{
    BlockStore, ContainerId, FindOps, Item, LeafLayout, Options, SnapshotId, Tree, TreeReader,
};

pub const CONTAINER: ContainerId = ContainerId(1);

pub fn opts(leaf_capacity: usize, branch_capacity: usize) -> Options {
    let mut opts = Options::new();
    opts.block_size(1024);
    opts.leaf_capacity(leaf_capacity);
    opts.branch_capacity(branch_capacity);
    opts.metrics(true);
    opts
}

/// A store with one snapshot holding one empty container.
#[allow(dead_code)]
pub struct Test {
    pub store: BlockStore,
    pub snapshot: SnapshotId,
}

#[allow(dead_code)]
impl Test {
    pub fn new(layout: LeafLayout, leaf_capacity: usize, branch_capacity: usize) -> Self {
        Self::with_options(layout, opts(leaf_capacity, branch_capacity))
    }

    pub fn with_options(layout: LeafLayout, options: Options) -> Self {
        let mut store = BlockStore::open(options).unwrap();
        let snapshot = store.create_snapshot(None).unwrap();
        store.create_container(snapshot, CONTAINER, layout).unwrap();
        Test { store, snapshot }
    }

    pub fn tree(&mut self) -> Tree<'_> {
        self.store.tree(self.snapshot, CONTAINER).unwrap()
    }

    pub fn reader(&self, snapshot: SnapshotId) -> TreeReader<'_> {
        self.store.reader(snapshot, CONTAINER).unwrap()
    }

    /// Commit the current snapshot and continue in a child of it. Returns the committed one.
    pub fn branch(&mut self) -> SnapshotId {
        let parent = self.snapshot;
        self.store.commit(parent).unwrap();
        self.snapshot = self.store.create_snapshot(Some(parent)).unwrap();
        parent
    }

    /// Check the structure of the container in `snapshot` and the reference counts of the
    /// whole store.
    pub fn verify(&self, snapshot: SnapshotId) {
        self.reader(snapshot).verify().unwrap();
        self.store.verify_refcounts().unwrap();
    }
}

#[allow(dead_code)]
pub fn items(reader: &TreeReader) -> Vec<Item> {
    reader.iter().map(|i| i.unwrap()).collect()
}

#[allow(dead_code)]
pub fn keys(reader: &TreeReader) -> Vec<u64> {
    items(reader)
        .into_iter()
        .map(|item| match item {
            Item::Entry { key, .. } => key,
            other => panic!("not a map entry: {other:?}"),
        })
        .collect()
}

#[allow(dead_code)]
pub fn values(reader: &TreeReader) -> Vec<u64> {
    items(reader)
        .into_iter()
        .map(|item| match item {
            Item::Value(v) => v,
            other => panic!("not a value: {other:?}"),
        })
        .collect()
}
