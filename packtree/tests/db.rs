mod common;

use common::{opts, values, CONTAINER};
use packtree::{Db, Error, FindOps, InsertOps, LeafLayout, Metric, RemoveOps};

#[test]
fn readers_see_committed_snapshots_while_writers_proceed() {
    let db = Db::open(opts(4, 4)).unwrap();
    let base = db.create_snapshot(None).unwrap();
    db.create_container(base, CONTAINER, LeafLayout::Sequence)
        .unwrap();
    db.update(base, CONTAINER, |tree| {
        for v in 0..500 {
            tree.push_value(v)?;
        }
        Ok(())
    })
    .unwrap();
    db.commit(base).unwrap();

    std::thread::scope(|scope| {
        for writer in 0..4u64 {
            let db = db.clone();
            scope.spawn(move || {
                let s = db.create_snapshot(Some(base)).unwrap();
                for round in 0..50 {
                    db.update(s, CONTAINER, |tree| {
                        tree.update_value(round * 8 + writer, 10_000 + writer)?;
                        tree.remove_range(400, 401)?;
                        Ok(())
                    })
                    .unwrap();
                }
                db.view(s, CONTAINER, |reader| {
                    assert_eq!(reader.len()?, 450);
                    reader.verify().unwrap();
                    Ok(())
                })
                .unwrap();
                db.drop_snapshot(s).unwrap();
            });
        }
        for _ in 0..4 {
            let db = db.clone();
            scope.spawn(move || {
                for _ in 0..50 {
                    let guard = db.read_arc();
                    let reader = guard.reader(base, CONTAINER).unwrap();
                    assert_eq!(values(&reader), (0..500).collect::<Vec<_>>());
                }
            });
        }
    });

    db.read(|store| {
        store.verify_refcounts().unwrap();
        assert_eq!(store.snapshots(), vec![base]);
    });
}

#[test]
fn metrics_are_shared_between_handles() {
    let db = Db::open(opts(2, 4)).unwrap();
    let s = db.create_snapshot(None).unwrap();
    db.create_container(s, CONTAINER, LeafLayout::Sequence)
        .unwrap();

    let other = db.clone();
    other
        .update(s, CONTAINER, |tree| {
            for v in 0..10 {
                tree.push_value(v)?;
            }
            Ok(())
        })
        .unwrap();
    assert!(db.metrics().get(Metric::NodeSplits) > 0);
}

#[test]
fn failed_updates_change_nothing() {
    let db = Db::open(opts(4, 4)).unwrap();
    let s = db.create_snapshot(None).unwrap();
    db.create_container(s, CONTAINER, LeafLayout::Map).unwrap();
    db.update(s, CONTAINER, |tree| {
        for key in 0..200 {
            tree.map_insert(key * 2, Some(key))?;
        }
        Ok(())
    })
    .unwrap();
    let blocks = db.read(|store| store.block_count());

    let outcome = db.update(s, CONTAINER, |tree| {
        tree.map_insert(1, None)?;
        tree.map_remove_range(100, 300)?;
        tree.map_insert(u64::MAX, Some(0))
    });
    assert!(matches!(outcome, Err(Error::ValueOutOfRange { .. })));

    db.view(s, CONTAINER, |reader| {
        assert_eq!(reader.len()?, 200);
        assert_eq!(reader.map_get(1)?, None);
        assert_eq!(reader.map_get(150)?, Some(Some(75)));
        reader.verify().unwrap();
        Ok(())
    })
    .unwrap();
    db.read(|store| {
        assert_eq!(store.block_count(), blocks);
        assert_eq!(store.snapshots(), vec![s]);
        store.verify_refcounts().unwrap();
    });

    // the same edits without the failing one are kept.
    db.update(s, CONTAINER, |tree| {
        tree.map_insert(1, None)?;
        tree.map_remove_range(100, 300)
    })
    .unwrap();
    db.view(s, CONTAINER, |reader| {
        assert_eq!(reader.len()?, 101);
        assert_eq!(reader.map_get(1)?, Some(None));
        reader.verify().unwrap();
        Ok(())
    })
    .unwrap();
}
