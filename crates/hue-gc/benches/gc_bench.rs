//! GC Performance Benchmarks
//!
//! Measures allocation throughput, barrier cost and cycle time.
//!
//! Run with: `cargo bench -p hue-gc`

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use hue_gc::{Collector, FixedSlots, GcConfig, GcGeneration, RootType};
use std::hint::black_box;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn bench_config() -> GcConfig {
    GcConfig {
        max_heap_size: 512 * 1024 * 1024,
        gc_trigger_ratio: 1.0,
        ..GcConfig::default()
    }
}

/// TLAB fast path, refills included
fn allocation_throughput_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocation_throughput");
    let collector = Collector::new(bench_config()).unwrap();
    let mut mutator = collector.mutator();

    for size in [16usize, 64, 512] {
        group.throughput(Throughput::Elements(1000));
        group.bench_with_input(BenchmarkId::new("bytes", size), &size, |b, &size| {
            b.iter(|| {
                for _ in 0..1000 {
                    black_box(mutator.allocate(size).unwrap());
                }
                // garbage only; a young cycle now and then keeps the heap small
                if collector.heap_occupancy().committed_bytes > 256 * 1024 * 1024 {
                    mutator.collect(GcGeneration::Young).unwrap();
                }
            });
        });
    }
    group.finish();
}

/// Load barrier on a slot that already carries the good color
fn barrier_benchmark(c: &mut Criterion) {
    let collector = Collector::new(bench_config()).unwrap();
    let layout = collector
        .register_layout(Arc::new(FixedSlots(vec![0])))
        .unwrap();
    let mut mutator = collector.mutator();
    let parent = mutator.allocate_with_layout(16, layout).unwrap();
    let child = mutator.allocate(16).unwrap();
    mutator.store_ref(parent, 0, Some(child)).unwrap();

    c.bench_function("load_ref_fast_path", |b| {
        b.iter(|| black_box(mutator.load_ref(black_box(parent), 0).unwrap()));
    });
    c.bench_function("store_ref_idle", |b| {
        b.iter(|| mutator.store_ref(parent, 0, black_box(Some(child))).unwrap());
    });
}

/// Full cycle over a rooted list with as much garbage as live data
fn gc_cycle_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("gc_cycle");
    group.sample_size(10);

    for live in [1_000usize, 10_000, 50_000] {
        group.bench_with_input(BenchmarkId::new("live_objects", live), &live, |b, &live| {
            b.iter_custom(|iters| {
                let mut total = Duration::ZERO;
                for _ in 0..iters {
                    let collector = Collector::new(bench_config()).unwrap();
                    let layout = collector
                        .register_layout(Arc::new(FixedSlots(vec![0])))
                        .unwrap();
                    let mut mutator = collector.mutator();
                    let root = collector.register_root(None, RootType::Global).unwrap();
                    for _ in 0..live {
                        let head = collector.root(root).unwrap();
                        let next = mutator.allocate_with_layout(32, layout).unwrap();
                        mutator.store_ref(next, 0, head).unwrap();
                        collector.set_root(root, Some(next)).unwrap();
                        black_box(mutator.allocate(32).unwrap());
                    }

                    let start = Instant::now();
                    mutator.collect(GcGeneration::Full).unwrap();
                    total += start.elapsed();
                }
                total
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    allocation_throughput_benchmark,
    barrier_benchmark,
    gc_cycle_benchmark
);
criterion_main!(benches);
