//! Benchmarks for admission, eviction and restore through the `budget_pool` crate.
#![allow(
    missing_docs,
    reason = "No need for API documentation in benchmark code"
)]

use std::hint::black_box;
use std::num::NonZero;
use std::time::Instant;

use budget_pool::{CompressedPooledVec, CountLimitedPool};
use criterion::{Criterion, criterion_group, criterion_main};

criterion_group!(benches, entrypoint);
criterion_main!(benches);

const VECTOR_LEN: usize = 256;

fn pool_with_limit(limit: usize) -> CountLimitedPool<u64> {
    CountLimitedPool::builder()
        .limit(NonZero::new(limit).unwrap())
        .build()
}

fn entrypoint(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool_churn");

    group.bench_function("push_within_budget", |b| {
        b.iter_custom(|iters| {
            let pool = pool_with_limit(usize::try_from(iters).unwrap().max(1));
            let vector = CompressedPooledVec::new(&pool);

            let start = Instant::now();

            for value in 0..iters {
                vector.push(black_box(value)).unwrap();
            }

            start.elapsed()
        });
    });

    group.bench_function("read_admitted", |b| {
        let pool = pool_with_limit(VECTOR_LEN);
        let vector = CompressedPooledVec::new(&pool);
        vector.extend_from_slice(&[7; VECTOR_LEN]).unwrap();

        b.iter(|| black_box(vector.get(black_box(100)).unwrap()));
    });

    // Two vectors take turns in a budget that fits only one, so every read evicts the other.
    group.bench_function("read_alternating_evicted", |b| {
        let pool = pool_with_limit(VECTOR_LEN);
        let first = CompressedPooledVec::new(&pool);
        let second = CompressedPooledVec::new(&pool);
        first.extend_from_slice(&[1; VECTOR_LEN]).unwrap();
        second.extend_from_slice(&[2; VECTOR_LEN]).unwrap();

        b.iter(|| {
            black_box(first.get(0).unwrap());
            black_box(second.get(0).unwrap());
        });
    });

    group.finish();
}
