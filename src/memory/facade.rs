//! Allocator façade (spec §4.10 — component C10).
//!
//! Fronts the user-facing API: a fixed array of heap arenas and a fixed
//! array of direct arenas, a per-thread cache lazily created and pinned to
//! the least-loaded arena on first use, and the `calculateNewCapacity`
//! growth policy. Grounded on the donor's `src/memory/allocator/mod.rs`
//! top-level pool type, which plays the same "owns everything, thin
//! routing logic" role.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{PoolError, Result};
use crate::memory::arena::{Arena, ArenaCounters, ArenaKind, BufferView};
use crate::memory::config::PoolConfig;
use crate::memory::region::{DirectRegionProvider, HeapRegionProvider};
use crate::memory::size_class::SizeClasses;
use crate::memory::thread_cache::ThreadCache;

static NEXT_FACADE_ID: AtomicUsize = AtomicUsize::new(0);

/// One entry per (facade, heap|direct) pair a thread has ever allocated
/// from; each thread gets at most one heap cache and one direct cache,
/// matching spec §4.10's "thread cache pins to that arena for its life"
/// per memory kind.
thread_local! {
    static THREAD_CACHES: RefCell<HashMap<(usize, bool), ThreadCache>> = RefCell::new(HashMap::new());
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PoolMetrics {
    pub num_heap_arenas: usize,
    pub num_direct_arenas: usize,
    pub total_active_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct ArenaMetrics {
    pub id: usize,
    pub kind: ArenaKind,
    pub counters: ArenaCounters,
}

pub struct AllocatorFacade {
    id: usize,
    /// Heap arenas occupy `[0, heap_arenas.len())`, direct arenas occupy
    /// `[heap_arenas.len(), heap_arenas.len() + direct_arenas.len())`; a
    /// `BufferView::arena` index is resolved against this combined space.
    heap_arenas: Vec<Arc<Arena>>,
    direct_arenas: Vec<Arc<Arena>>,
    size_classes_plain: Arc<SizeClasses>,
    size_classes_aligned: Arc<SizeClasses>,
    config: Arc<PoolConfig>,
}

impl AllocatorFacade {
    pub fn new(config: PoolConfig) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let size_classes_plain = Arc::new(SizeClasses::new(config.page_size, config.chunk_size(), 0));
        let size_classes_aligned = Arc::new(SizeClasses::new(
            config.page_size,
            config.chunk_size(),
            config.direct_memory_cache_alignment,
        ));

        let heap_arenas = (0..config.num_heap_arenas)
            .map(|id| {
                Arc::new(Arena::new(
                    id,
                    ArenaKind::Heap,
                    Box::new(HeapRegionProvider),
                    size_classes_plain.clone(),
                    config.clone(),
                ))
            })
            .collect::<Vec<_>>();
        let direct_arenas = (0..config.num_direct_arenas)
            .map(|i| {
                Arc::new(Arena::new(
                    heap_arenas.len() + i,
                    ArenaKind::Direct,
                    Box::new(DirectRegionProvider),
                    size_classes_aligned.clone(),
                    config.clone(),
                ))
            })
            .collect::<Vec<_>>();

        let id = NEXT_FACADE_ID.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            heap_arenas = heap_arenas.len(),
            direct_arenas = direct_arenas.len(),
            page_size = config.page_size,
            chunk_size = config.chunk_size(),
            "allocator facade initialized"
        );
        Ok(Self {
            id,
            heap_arenas,
            direct_arenas,
            size_classes_plain,
            size_classes_aligned,
            config,
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn size_classes_for(&self, prefer_direct: bool) -> &Arc<SizeClasses> {
        if prefer_direct {
            &self.size_classes_aligned
        } else {
            &self.size_classes_plain
        }
    }

    fn pool_for(&self, prefer_direct: bool) -> Result<&[Arc<Arena>]> {
        let pool = if prefer_direct { &self.direct_arenas } else { &self.heap_arenas };
        if pool.is_empty() {
            return Err(PoolError::ConfigInvalid(format!(
                "no {} arenas configured",
                if prefer_direct { "direct" } else { "heap" }
            )));
        }
        Ok(pool)
    }

    fn least_loaded(pool: &[Arc<Arena>]) -> Arc<Arena> {
        pool.iter()
            .min_by_key(|a| a.num_thread_caches())
            .expect("pool checked non-empty by caller")
            .clone()
    }

    /// Resolves a `BufferView::arena` index back to the owning arena,
    /// regardless of which pool created it.
    fn arena_by_id(&self, id: usize) -> &Arc<Arena> {
        self.heap_arenas
            .iter()
            .chain(self.direct_arenas.iter())
            .find(|a| a.id == id)
            .expect("BufferView::arena must name a live arena in this facade")
    }

    /// Spec §4.10: allocate via this thread's cache first, falling back to
    /// the arena directly on a miss or for huge (unpooled) requests, which
    /// are never cached.
    pub fn allocate(&self, req_cap: usize, max_cap: usize, prefer_direct: bool) -> Result<BufferView> {
        let sc = self.size_classes_for(prefer_direct);
        let si = sc.size2size_idx(req_cap.max(1) as u64);
        if si >= sc.n_sizes() {
            let arena = Self::least_loaded(self.pool_for(prefer_direct)?);
            return arena.allocate(req_cap, max_cap);
        }

        let key = (self.id, prefer_direct);
        THREAD_CACHES.with(|caches| {
            let mut caches = caches.borrow_mut();
            if !caches.contains_key(&key) {
                let arena = Self::least_loaded(self.pool_for(prefer_direct)?);
                let tc = ThreadCache::new(
                    arena,
                    sc,
                    self.config.small_cache_size,
                    self.config.normal_cache_size,
                    self.config.max_cached_buffer_capacity,
                    self.config.cache_trim_interval,
                );
                caches.insert(key, tc);
            }
            let tc = caches.get_mut(&key).expect("just inserted");
            if let Some(view) = tc.allocate(sc, si) {
                tc.maybe_trim();
                return Ok(view);
            }
            let view = tc.arena().allocate(req_cap, max_cap)?;
            tc.maybe_trim();
            Ok(view)
        })
    }

    /// Offers `view` to this thread's cache for its owning arena; falls
    /// back to freeing directly through the owning arena when the view
    /// belongs to another arena, is a huge allocation, or the cache is full.
    pub fn free(&self, view: BufferView) -> Result<()> {
        let prefer_direct = view.arena >= self.heap_arenas.len();
        let key = (self.id, prefer_direct);
        let accepted = THREAD_CACHES.with(|caches| {
            let mut caches = caches.borrow_mut();
            match caches.get_mut(&key) {
                Some(tc) => {
                    let sc = self.size_classes_for(prefer_direct);
                    tc.add(sc, view)
                }
                None => false,
            }
        });
        if accepted {
            return Ok(());
        }
        self.arena_by_id(view.arena).free(view)
    }

    pub fn reallocate(&self, view: BufferView, new_cap: usize, free_old: bool) -> Result<(BufferView, usize)> {
        self.arena_by_id(view.arena).reallocate(view, new_cap, free_old)
    }

    /// Spec §6 `calculateNewCapacity`: the user-layer growth policy,
    /// defined here since the allocator owns the 4 MiB threshold semantics.
    pub fn calculate_new_capacity(min_new_cap: usize, max_cap: usize) -> usize {
        const FOUR_MIB: usize = 4 * 1024 * 1024;
        if min_new_cap == FOUR_MIB {
            return FOUR_MIB;
        }
        if min_new_cap > FOUR_MIB {
            let rounded = min_new_cap.div_ceil(FOUR_MIB) * FOUR_MIB + FOUR_MIB;
            return rounded.min(max_cap);
        }
        let mut cap = 64usize;
        while cap < min_new_cap {
            cap *= 2;
        }
        cap.min(max_cap)
    }

    pub fn as_slice<R>(&self, view: &BufferView, f: impl FnOnce(&[u8]) -> R) -> R {
        self.arena_by_id(view.arena).with_bytes(view, f)
    }

    pub fn as_mut_slice<R>(&self, view: &BufferView, f: impl FnOnce(&mut [u8]) -> R) -> R {
        self.arena_by_id(view.arena).with_bytes_mut(view, f)
    }

    pub fn metrics(&self) -> PoolMetrics {
        let total_active_bytes = self
            .heap_arenas
            .iter()
            .chain(self.direct_arenas.iter())
            .map(|a| a.active_bytes())
            .sum();
        PoolMetrics {
            num_heap_arenas: self.heap_arenas.len(),
            num_direct_arenas: self.direct_arenas.len(),
            total_active_bytes,
        }
    }

    pub fn arena_metrics(&self) -> Vec<ArenaMetrics> {
        self.heap_arenas
            .iter()
            .chain(self.direct_arenas.iter())
            .map(|a| ArenaMetrics {
                id: a.id,
                kind: a.kind,
                counters: a.counters(),
            })
            .collect()
    }

    /// Drains this thread's own caches back to their arenas, then asserts
    /// (debug builds only) that every arena is fully idle. Cross-thread
    /// caches still drain via their own `Drop` when their owning threads
    /// exit (spec §11 "graceful facade shutdown").
    pub fn shutdown(&self) {
        THREAD_CACHES.with(|caches| {
            let mut caches = caches.borrow_mut();
            caches.retain(|(facade_id, _), _| *facade_id != self.id);
        });
        debug_assert!(
            self.heap_arenas.iter().chain(self.direct_arenas.iter()).all(|a| a.active_bytes() == 0),
            "facade shutdown with live allocations outstanding"
        );
    }
}
