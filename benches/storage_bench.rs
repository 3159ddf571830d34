//! Benchmarks for the profile storage engine
//!
//! Run with: cargo bench

use chrono::{DateTime, Utc};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use profilestore::storage::*;
use tempfile::tempdir;

fn ts(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap()
}

/// A tree with `stacks` distinct stacks of depth 8
fn create_test_tree(stacks: usize) -> Tree {
    let mut tree = Tree::new();
    for i in 0..stacks {
        let stack = (0..8)
            .map(|depth| format!("fn_{}_{}", depth, i % (depth * 4 + 1)))
            .collect::<Vec<_>>()
            .join(";");
        tree.insert_stack(&stack, (i % 17 + 1) as u64).unwrap();
    }
    tree
}

fn bench_tree(c: &mut Criterion) {
    let mut group = c.benchmark_group("tree");

    for size in [100, 1000] {
        let tree = create_test_tree(size);
        group.throughput(Throughput::Elements(size as u64));

        group.bench_function(format!("merge_{}", size), |b| {
            b.iter(|| {
                let mut acc = Tree::new();
                acc.merge(black_box(&tree));
                acc
            })
        });

        let weights: [u64; 3] = [3, 5, 2];
        group.bench_function(format!("split_{}", size), |b| {
            b.iter(|| tree.split(black_box(&weights[..])))
        });

        let text = tree.to_string();
        group.bench_function(format!("parse_collapsed_{}", size), |b| {
            b.iter(|| Tree::from_collapsed(black_box(&text)).unwrap())
        });
    }

    group.finish();
}

fn bench_engine(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine");
    let tree = create_test_tree(200);

    group.bench_function("put_10s", |b| {
        let dir = tempdir().unwrap();
        let storage = Storage::new(StorageConfig::new(dir.path())).unwrap();
        let key = Key::parse("bench.cpu{env=bench}").unwrap();
        let mut t = 0;

        b.iter(|| {
            let input = PutInput::new(key.clone(), ts(t), ts(t + 10), tree.clone());
            storage.put(black_box(input)).unwrap();
            t += 10;
        });
    });

    group.bench_function("get_day", |b| {
        let dir = tempdir().unwrap();
        let storage = Storage::new(StorageConfig::new(dir.path())).unwrap();
        let key = Key::parse("bench.cpu{env=bench}").unwrap();

        // A day of 10 second profiles
        for i in 0..8640 {
            let input = PutInput::new(key.clone(), ts(i * 10), ts(i * 10 + 10), tree.clone());
            storage.put(input).unwrap();
        }
        storage.flush().unwrap();

        b.iter(|| {
            let input = GetInput::new(key.clone(), ts(0), ts(86_400));
            storage.get(black_box(input)).unwrap()
        });
    });

    group.finish();
}

criterion_group!(benches, bench_tree, bench_engine);
criterion_main!(benches);
