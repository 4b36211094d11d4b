//! Benchmarks for change propagation.
//!
//! Run with: `cargo bench --package ripple-core --bench propagation`
//!
//! - Write to an observable feeding a linear chain of eager computeds
//! - Write to an observable read by a wide fan of computeds
//! - Re-evaluation cost of a computed with many dependencies

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use ripple_core::{Computed, Observable};
use std::hint::black_box;

fn build_chain(depth: usize) -> (Observable<u64>, Computed<u64>) {
    let source = Observable::new(0_u64);
    let mut tail = {
        let source = source.clone();
        Computed::new(move || source.get() + 1)
    };
    for _ in 1..depth {
        let previous = tail.clone();
        tail = Computed::new(move || previous.get() + 1);
    }
    (source, tail)
}

fn bench_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("propagation/chain");
    for depth in [10_usize, 50, 200] {
        group.throughput(Throughput::Elements(depth as u64));
        let (source, tail) = build_chain(depth);
        let mut n = 0_u64;
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, _| {
            b.iter(|| {
                n += 1;
                source.set(n);
                black_box(tail.peek())
            });
        });
    }
    group.finish();
}

fn bench_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("propagation/fan_out");
    for width in [10_usize, 100, 1_000] {
        group.throughput(Throughput::Elements(width as u64));
        let source = Observable::new(0_u64);
        let readers: Vec<Computed<u64>> = (0..width)
            .map(|i| {
                let source = source.clone();
                Computed::new(move || source.get() * i as u64)
            })
            .collect();
        let mut n = 0_u64;
        group.bench_with_input(BenchmarkId::from_parameter(width), &width, |b, _| {
            b.iter(|| {
                n += 1;
                source.set(n);
                black_box(readers.len())
            });
        });
    }
    group.finish();
}

fn bench_fan_in(c: &mut Criterion) {
    let mut group = c.benchmark_group("propagation/fan_in");
    for inputs in [10_usize, 100, 1_000] {
        group.throughput(Throughput::Elements(inputs as u64));
        let sources: Vec<Observable<u64>> = (0..inputs).map(|i| Observable::new(i as u64)).collect();
        let sum = {
            let sources = sources.clone();
            Computed::new(move || sources.iter().map(Observable::get).sum::<u64>())
        };
        let mut n = 0_u64;
        group.bench_with_input(BenchmarkId::from_parameter(inputs), &inputs, |b, _| {
            b.iter(|| {
                n += 1;
                sources[0].set(n);
                black_box(sum.peek())
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_chain, bench_fan_out, bench_fan_in);
criterion_main!(benches);
