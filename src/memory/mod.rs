// # Memory Module
//
// A jemalloc/Netty-style pooled allocator for fixed-lifetime byte buffers:
// size classing, chunk/run allocation with bitfield-packed handles, subpage
// slot allocation for small requests, usage-banded chunk migration, and a
// per-thread cache that keeps the steady-state allocate/free path off the
// arena lock.
//
// ## Layered components, leaves first
//
// - `config`: pool-wide tunables (`PoolConfig`).
// - `size_class`: request bytes <-> size index <-> page index (`SizeClasses`).
// - `handle`: bitfield packing for (run offset, run pages, in-use, is-subpage, bitmap index).
// - `offset_map`: open-addressed `u32 offset -> u64 handle` index used by a chunk's free runs.
// - `page_queue`: one ordered queue per page-index of free run handles.
// - `region`: the heap/direct backing-storage seam (`Region`, `RegionProvider`).
// - `subpage`: one run reinterpreted as N equal slots tracked by a bitmap.
// - `chunk`: a 16 MiB region combining the above into allocate/free/coalesce.
// - `chunk_list`: the six usage-band thresholds chunks migrate between.
// - `arena`: owns a chunk slab and the per-size subpage free lists behind one mutex.
// - `thread_cache`: per-thread bounded queues of recently freed blocks.
// - `facade`: the public entry point — arena selection, growth policy, metrics.
//
// ## Quick start
//
// ```rust,no_run
// use pooled_alloc::memory::config::PoolConfig;
// use pooled_alloc::memory::facade::AllocatorFacade;
//
// let facade = AllocatorFacade::new(PoolConfig::default()).unwrap();
// let view = facade.allocate(1024, 8192, false).unwrap();
// facade.as_mut_slice(&view, |buf| buf[0] = 0xAB);
// facade.free(view).unwrap();
// ```

pub mod arena;
pub mod chunk;
pub mod chunk_list;
pub mod config;
pub mod facade;
pub mod handle;
pub mod offset_map;
pub mod page_queue;
pub mod region;
pub mod size_class;
pub mod subpage;
pub mod thread_cache;

pub use arena::{AllocKind, Arena, ArenaCounters, ArenaKind, BufferView};
pub use config::PoolConfig;
pub use facade::{AllocatorFacade, ArenaMetrics, PoolMetrics};
pub use size_class::SizeClasses;
