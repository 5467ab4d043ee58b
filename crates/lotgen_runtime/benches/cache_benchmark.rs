//! Benchmark for the cache hit path.
//!
//! TARGET: a hit costs one fingerprinted lookup under the cache lock
//!
//! Run with: cargo bench --package lotgen_runtime --bench cache_benchmark

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use lotgen_core::{GenerationOptions, GenerationRequest, GenerationResult, InitialShape, Ring};
use lotgen_runtime::{GenerationCache, Lookup};

fn lot(offset: f64) -> InitialShape {
    InitialShape::new(
        Ring::new([
            [offset, 0.0, 0.0],
            [offset + 10.0, 0.0, 0.0],
            [offset + 10.0, 10.0, 0.0],
            [offset, 10.0, 0.0],
        ]),
        "simple_extrude",
        "Default$Lot",
    )
}

fn warm_cache(requests: &[GenerationRequest]) -> GenerationCache {
    let cache = GenerationCache::default();
    for request in requests {
        if let Lookup::Miss(ticket, _) = cache.lookup(request) {
            cache.complete(ticket, Ok(Arc::new(GenerationResult::default())));
        }
    }
    cache
}

fn benchmark_hit(c: &mut Criterion) {
    let requests: Vec<_> = (0..1_000)
        .map(|i| GenerationRequest::new(&lot(f64::from(i)), 42, GenerationOptions::default()))
        .collect();
    let cache = warm_cache(&requests);

    let mut group = c.benchmark_group("cache");
    group.throughput(Throughput::Elements(requests.len() as u64));
    group.bench_function("hit_1000", |b| {
        b.iter(|| {
            for request in &requests {
                black_box(cache.lookup(black_box(request)));
            }
        });
    });
    group.finish();
}

fn benchmark_fingerprint(c: &mut Criterion) {
    let shape = lot(0.0);
    c.bench_function("request_fingerprint", |b| {
        b.iter(|| GenerationRequest::new(black_box(&shape), 42, GenerationOptions::default()).fingerprint());
    });
}

criterion_group!(benches, benchmark_hit, benchmark_fingerprint);
criterion_main!(benches);
