#![cfg(feature = "benchmarks")]

use criterion::{BatchSize, BenchmarkId, Criterion};
use rand::{Rng, SeedableRng};

use crate::{BlockStore, ContainerId, FindOps, InsertOps, LeafLayout, Options, RemoveOps};

const KEY_SPACE: u64 = 1 << 48;

pub fn tree_benchmark(c: &mut Criterion) {
    insert_benchmark(c);
    find_benchmark(c);
    remove_range_benchmark(c);
}

/// A store with one map container holding `n` random keys.
fn filled_map(n: u64) -> (BlockStore, crate::SnapshotId) {
    let mut store = BlockStore::open(Options::new()).unwrap();
    let s = store.create_snapshot(None).unwrap();
    store
        .create_container(s, ContainerId(0), LeafLayout::Map)
        .unwrap();
    let mut rng = rand::rngs::StdRng::seed_from_u64(n);
    let mut tree = store.tree(s, ContainerId(0)).unwrap();
    for _ in 0..n {
        tree.map_insert(rng.gen_range(0..KEY_SPACE), Some(rng.gen())).unwrap();
    }
    (store, s)
}

fn insert_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert");

    for size in [1_000u64, 100_000] {
        group.bench_function(BenchmarkId::new("map_insert", size), |b| {
            b.iter_batched(
                || filled_map(size),
                |(mut store, s)| {
                    let mut tree = store.tree(s, ContainerId(0)).unwrap();
                    let mut rng = rand::thread_rng();
                    for _ in 0..100 {
                        tree.map_insert(rng.gen_range(0..KEY_SPACE), None).unwrap();
                    }
                },
                BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

fn find_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("find");

    for size in [1_000u64, 100_000] {
        let (store, s) = filled_map(size);
        let reader = store.reader(s, ContainerId(0)).unwrap();
        group.bench_function(BenchmarkId::new("find_position", size), |b| {
            let mut rng = rand::thread_rng();
            b.iter(|| reader.find_position(rng.gen_range(0..size)).unwrap());
        });
        group.bench_function(BenchmarkId::new("map_get", size), |b| {
            let mut rng = rand::thread_rng();
            b.iter(|| reader.map_get(rng.gen_range(0..KEY_SPACE)).unwrap());
        });
    }

    group.finish();
}

fn remove_range_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("remove_range");

    for width in [10u64, 1_000] {
        group.bench_function(BenchmarkId::new("width", width), |b| {
            b.iter_batched(
                || {
                    let (mut store, s) = filled_map(10_000);
                    store.commit(s).unwrap();
                    let child = store.create_snapshot(Some(s)).unwrap();
                    (store, child)
                },
                |(mut store, s)| {
                    let mut tree = store.tree(s, ContainerId(0)).unwrap();
                    tree.remove_range(5_000, 5_000 + width).unwrap();
                },
                BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}
