// Pooled allocator benchmarks: thread-cache hits against cold,
// arena-locked allocations, the same shape as the donor's
// `benches/buffer_pool_bench.rs` (criterion groups per access pattern).

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use pooled_alloc::memory::config::PoolConfig;
use pooled_alloc::memory::facade::AllocatorFacade;

fn single_arena_facade() -> AllocatorFacade {
    let mut cfg = PoolConfig::default();
    cfg.num_heap_arenas = 1;
    cfg.num_direct_arenas = 0;
    AllocatorFacade::new(cfg).unwrap()
}

fn bench_thread_cache_hit(c: &mut Criterion) {
    let mut group = c.benchmark_group("thread_cache_hit");

    for size in [16usize, 256, 4096] {
        group.bench_with_input(BenchmarkId::new("allocate_free", size), &size, |b, &size| {
            let facade = single_arena_facade();
            // Warm the cache so steady-state iterations hit it.
            let warm = facade.allocate(size, size, false).unwrap();
            facade.free(warm).unwrap();
            b.iter(|| {
                let view = facade.allocate(black_box(size), size, false).unwrap();
                facade.free(view).unwrap();
            });
        });
    }

    group.finish();
}

fn bench_cold_arena_allocation(c: &mut Criterion) {
    let mut group = c.benchmark_group("cold_arena_allocation");

    for size in [16usize, 256, 4096, 64 * 1024] {
        group.bench_with_input(BenchmarkId::new("run_allocate", size), &size, |b, &size| {
            let config = std::sync::Arc::new(PoolConfig::default());
            let sc = std::sync::Arc::new(pooled_alloc::memory::size_class::SizeClasses::new(
                config.page_size,
                config.chunk_size(),
                0,
            ));
            let arena = pooled_alloc::memory::arena::Arena::new(
                0,
                pooled_alloc::memory::arena::ArenaKind::Heap,
                Box::new(pooled_alloc::memory::region::HeapRegionProvider),
                sc,
                config,
            );
            b.iter(|| {
                let view = arena.allocate(black_box(size), size).unwrap();
                arena.free(view).unwrap();
            });
        });
    }

    group.finish();
}

fn bench_huge_allocation(c: &mut Criterion) {
    let mut group = c.benchmark_group("huge_allocation");
    group.bench_function("32mib_bypass", |b| {
        let facade = single_arena_facade();
        b.iter(|| {
            let view = facade.allocate(black_box(32 * 1024 * 1024), 32 * 1024 * 1024, false).unwrap();
            facade.free(view).unwrap();
        });
    });
    group.finish();
}

criterion_group!(benches, bench_thread_cache_hit, bench_cold_arena_allocation, bench_huge_allocation);
criterion_main!(benches);
