//! Local Store benchmarks.

use casesync_bench::random_data;
use casesync_storage::{FileStore, InMemoryStore, LocalStore, Partition};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tempfile::TempDir;

/// Benchmark blob writes.
fn bench_put(c: &mut Criterion) {
    let mut group = c.benchmark_group("put");

    for size in [1024, 64 * 1024, 1024 * 1024].iter() {
        let data = random_data(*size);
        group.throughput(Throughput::Bytes(*size as u64));

        group.bench_with_input(BenchmarkId::new("memory", size), size, |b, _| {
            let store = InMemoryStore::new();
            b.iter(|| store.put(Partition::DocumentBlob, "doc", black_box(&data)).unwrap());
        });

        group.bench_with_input(BenchmarkId::new("file", size), size, |b, _| {
            let dir = TempDir::new().unwrap();
            let store = FileStore::open(dir.path()).unwrap();
            b.iter(|| store.put(Partition::DocumentBlob, "doc", black_box(&data)).unwrap());
        });
    }
    group.finish();
}

/// Benchmark listing a populated metadata partition.
fn bench_get_all(c: &mut Criterion) {
    let mut group = c.benchmark_group("get_all");

    for count in [10, 100, 1000].iter() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        for i in 0..*count {
            store
                .put(Partition::DocumentMeta, &format!("doc-{i}"), &random_data(256))
                .unwrap();
        }

        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, _| {
            b.iter(|| {
                let all = store.get_all(Partition::DocumentMeta).unwrap();
                black_box(all);
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_put, bench_get_all);
criterion_main!(benches);
