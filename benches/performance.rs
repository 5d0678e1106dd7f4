//! Performance benchmarks for the run-state store.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use runstate::{
    reassemble, KeyBuilder, MemoryBackend, Partitioner, StateKey, StateStore, StateStoreConfig,
};
use std::num::NonZeroUsize;
use std::sync::Arc;
use tempfile::TempDir;

fn create_store(dir: &TempDir) -> StateStore {
    let config = StateStoreConfig {
        namespace: "bench".into(),
        state_dir: dir.path().to_path_buf(),
        ..Default::default()
    };
    let backend = Arc::new(MemoryBackend::new(config.table_name()));
    StateStore::open(config, backend).unwrap()
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Benchmark splitting and reassembling values of varying size
fn bench_partitioning(c: &mut Criterion) {
    let mut group = c.benchmark_group("partitioning");
    let partitioner = Partitioner::new(NonZeroUsize::new(400_000).unwrap());

    for size in [1_000, 500_000, 4_000_000] {
        let value = payload(size);
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("split", size), &value, |b, value| {
            b.iter(|| black_box(partitioner.chunks_for("job_state nightly", value)));
        });

        let chunks = partitioner.chunks_for("job_state nightly", &value);
        group.bench_with_input(BenchmarkId::new("reassemble", size), &chunks, |b, chunks| {
            b.iter(|| black_box(reassemble("job_state nightly", chunks).unwrap()));
        });
    }

    group.finish();
}

/// Benchmark batch saves with varying key counts
fn bench_save(c: &mut Criterion) {
    let mut group = c.benchmark_group("save");
    group.sample_size(20);

    for keys in [1, 10, 50] {
        group.bench_with_input(BenchmarkId::new("keys", keys), &keys, |b, &keys| {
            let dir = TempDir::new().unwrap();
            let store = create_store(&dir);
            let pairs: Vec<(StateKey, Vec<u8>)> = (0..keys)
                .map(|i| (KeyBuilder::build("job_run", i), payload(10_000)))
                .collect();

            b.iter(|| {
                let report = store.save(&pairs);
                assert!(report.is_success());
            });
        });
    }

    group.finish();
}

/// Benchmark restores served by the primary and by the mirror
fn bench_restore(c: &mut Criterion) {
    let mut group = c.benchmark_group("restore");

    let dir = TempDir::new().unwrap();
    let store = create_store(&dir);
    let keys: Vec<StateKey> = (0..20).map(|i| KeyBuilder::build("job_run", i)).collect();
    let pairs: Vec<_> = keys.iter().map(|k| (k.clone(), payload(600_000))).collect();
    assert!(store.save(&pairs).is_success());

    group.bench_function("primary", |b| {
        b.iter(|| black_box(store.restore(&keys)));
    });

    assert!(store.delete(&keys).is_success());
    group.bench_function("mirror", |b| {
        b.iter(|| black_box(store.restore(&keys)));
    });

    group.finish();
}

criterion_group!(benches, bench_partitioning, bench_save, bench_restore);
criterion_main!(benches);
