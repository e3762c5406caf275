//! # Arena Benchmark
//!
//! Allocation is not the hot path, resolution is. Both are measured.
//!
//! Run with: `cargo bench --package kvindex_core`

// Benchmarks don't need docs
#![allow(missing_docs)]

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use kvindex_core::{Arena, ArenaFlags, ArenaGeometry, ElementHandle, HeapBacking, RegionCell};

/// Index entries are 64 bytes.
const ELEMENT_SIZE: u32 = 64;

fn heap_arena(stage_capacity: u32, flags: ArenaFlags) -> Arena {
    let geometry = ArenaGeometry::new(0, ELEMENT_SIZE, stage_capacity, 0, flags);
    Arena::create(RegionCell::detached(), Box::new(HeapBacking), geometry).unwrap()
}

/// Benchmark: allocate 100K elements, with and without the arena lock.
fn bench_alloc(c: &mut Criterion) {
    let mut group = c.benchmark_group("alloc_100k");

    for (name, flags) in [("big_lock", ArenaFlags::BIG_LOCK), ("unlocked", ArenaFlags::NONE)] {
        group.bench_with_input(BenchmarkId::from_parameter(name), &flags, |b, &flags| {
            b.iter(|| {
                let arena = heap_arena(1 << 16, flags);
                for _ in 0..100_000 {
                    black_box(arena.alloc().unwrap());
                }
            });
        });
    }

    group.finish();
}

/// Benchmark: read back elements by handle.
fn bench_resolve(c: &mut Criterion) {
    let arena = heap_arena(1 << 16, ArenaFlags::BIG_LOCK);
    let handles: Vec<ElementHandle> = (0..10_000).map(|_| arena.alloc().unwrap()).collect();

    c.bench_function("resolve_10k", |b| {
        b.iter(|| {
            let mut sum = 0u64;
            for handle in &handles {
                sum += u64::from(arena.resolve(*handle).unwrap()[0]);
            }
            black_box(sum)
        });
    });
}

criterion_group!(benches, bench_alloc, bench_resolve);
criterion_main!(benches);
