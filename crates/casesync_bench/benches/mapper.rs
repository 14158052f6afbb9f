//! Entity Mapper benchmarks.

use casesync_bench::generate_tree;
use casesync_model::{flatten, reconstruct};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

/// Benchmark flattening trees of growing size.
fn bench_flatten(c: &mut Criterion) {
    let mut group = c.benchmark_group("flatten");
    for clients in [10, 100, 500].iter() {
        let tree = generate_tree(*clients, 3);
        group.bench_with_input(BenchmarkId::from_parameter(clients), clients, |b, _| {
            b.iter(|| {
                let flat = flatten(black_box(&tree)).unwrap();
                black_box(flat);
            });
        });
    }
    group.finish();
}

/// Benchmark rebuilding trees from flat tables.
fn bench_reconstruct(c: &mut Criterion) {
    let mut group = c.benchmark_group("reconstruct");
    for clients in [10, 100, 500].iter() {
        let flat = flatten(&generate_tree(*clients, 3)).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(clients), clients, |b, _| {
            b.iter(|| {
                let rebuilt = reconstruct(black_box(&flat));
                black_box(rebuilt);
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_flatten, bench_reconstruct);
criterion_main!(benches);
