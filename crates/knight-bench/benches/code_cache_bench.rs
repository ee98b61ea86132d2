//! Code cache benchmarks.

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use knight_bench::{Op, churn_trace, code_sizes};
use knight_core::{CodeBlock, CodeCache};

fn bench_alloc_free_cycle(c: &mut Criterion) {
    let sizes: &[usize] = &[16, 64, 256, 1024, 4096];
    let mut group = c.benchmark_group("code_alloc_free_cycle");

    for &size in sizes {
        group.bench_with_input(BenchmarkId::new("code_cache", size), &size, |b, &sz| {
            let mut cache = CodeCache::new();
            b.iter(|| {
                let block = cache.alloc(sz).expect("code");
                criterion::black_box(block.addr());
                cache.free(block);
            });
        });
    }
    group.finish();
}

fn bench_burst(c: &mut Criterion) {
    let sizes = code_sizes(1_000);
    let mut group = c.benchmark_group("code_burst");

    group.bench_function("1000x_mixed_fresh_cache", |b| {
        b.iter(|| {
            let mut cache = CodeCache::new();
            for &size in &sizes {
                criterion::black_box(cache.alloc(size).expect("code").addr());
            }
            criterion::black_box(cache.region_count());
        });
    });

    group.finish();
}

fn bench_churn(c: &mut Criterion) {
    let trace = churn_trace(4_096, 60);
    let mut group = c.benchmark_group("code_churn");

    group.bench_function("4096_ops", |b| {
        b.iter(|| {
            let mut cache = CodeCache::new();
            let mut live: Vec<CodeBlock> = Vec::with_capacity(trace.len());
            for op in &trace {
                match *op {
                    Op::Alloc(size) => live.push(cache.alloc(size).expect("code")),
                    Op::Free(pick) => {
                        let block = live.swap_remove(pick % live.len());
                        cache.free(block);
                    }
                }
            }
            criterion::black_box(cache.stats());
        });
    });

    group.finish();
}

criterion_group!(benches, bench_alloc_free_cycle, bench_burst, bench_churn);
criterion_main!(benches);
