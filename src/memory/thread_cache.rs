//! Thread cache (spec §3, §4.9 — component C9).
//!
//! Per-thread, bounded, single-consumer/single-producer queues of recently
//! freed blocks, keyed by size class, so that a steady allocate/free
//! pattern never touches the arena mutex. Built on
//! `crossbeam::queue::ArrayQueue`, matching the teacher's preference for
//! lock-free bounded queues over a hand-rolled ring buffer.

use std::sync::Arc;

use crossbeam::queue::ArrayQueue;

use crate::memory::arena::{Arena, BufferView};
use crate::memory::size_class::SizeClasses;

struct SizeClassCache {
    queue: ArrayQueue<BufferView>,
    /// Allocations served from this queue since the last `trim()`.
    allocations_since_trim: u64,
}

impl SizeClassCache {
    fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            allocations_since_trim: 0,
        }
    }
}

/// Pinned to one arena for its entire life (spec §4.10 "thread-cache
/// acquire contract"). Created lazily by the façade on a thread's first
/// allocation; dropped (returning every cached entry to its arena) when
/// the owning thread exits.
pub struct ThreadCache {
    arena: Arc<Arena>,
    small: Vec<SizeClassCache>,
    /// `None` entries mark Normal size classes above
    /// `max_cached_buffer_capacity`, which are never cacheable.
    normal: Vec<Option<SizeClassCache>>,
    cache_trim_interval: u64,
    total_allocations: u64,
}

impl ThreadCache {
    pub fn new(
        arena: Arc<Arena>,
        sc: &SizeClasses,
        small_cache_size: usize,
        normal_cache_size: usize,
        max_cached_buffer_capacity: usize,
        cache_trim_interval: u64,
    ) -> Self {
        arena.bind_thread();
        let small = (0..sc.n_subpages()).map(|_| SizeClassCache::new(small_cache_size)).collect();
        let normal = (sc.n_subpages()..sc.n_sizes())
            .map(|idx| {
                if sc.size_idx2size(idx) as usize <= max_cached_buffer_capacity {
                    Some(SizeClassCache::new(normal_cache_size))
                } else {
                    None
                }
            })
            .collect();
        Self {
            arena,
            small,
            normal,
            cache_trim_interval: cache_trim_interval.max(1),
            total_allocations: 0,
        }
    }

    fn normal_slot(&mut self, si: usize, n_subpages: usize) -> Option<&mut Option<SizeClassCache>> {
        si.checked_sub(n_subpages).and_then(|i| self.normal.get_mut(i))
    }

    /// The arena this cache is pinned to for its entire life.
    pub fn arena(&self) -> &Arc<Arena> {
        &self.arena
    }

    /// Attempts to serve `si` from this thread's cache. Returns the cached
    /// view with no side effects on miss (spec §4.9).
    pub fn allocate(&mut self, sc: &SizeClasses, si: usize) -> Option<BufferView> {
        self.total_allocations += 1;
        let popped = if si < sc.n_subpages() {
            self.small.get(si).and_then(|c| c.queue.pop())
        } else {
            self.normal_slot(si, sc.n_subpages())?.as_ref().and_then(|c| c.queue.pop())
        };
        if popped.is_some() {
            if si < sc.n_subpages() {
                self.small[si].allocations_since_trim += 1;
            } else if let Some(Some(c)) = self.normal_slot(si, sc.n_subpages()) {
                c.allocations_since_trim += 1;
            }
        }
        popped
    }

    /// Offers a freed block to the cache. Rejects it (caller must free to
    /// the arena immediately) if it belongs to another arena, the size
    /// class isn't cacheable, or the queue is full (spec §4.9).
    pub fn add(&mut self, sc: &SizeClasses, view: BufferView) -> bool {
        if view.arena != self.arena.id {
            return false;
        }
        let si = view.size_idx;
        if si < sc.n_subpages() {
            self.small[si].queue.push(view).is_ok()
        } else {
            match self.normal_slot(si, sc.n_subpages()) {
                Some(Some(c)) => c.queue.push(view).is_ok(),
                _ => false,
            }
        }
    }

    /// Runs `trim()` every `cache_trim_interval` allocations, as the donor's
    /// periodic decay does (spec §4.9 "cache-trim triggers").
    pub fn maybe_trim(&mut self) {
        if self.total_allocations % self.cache_trim_interval == 0 {
            self.trim();
        }
    }

    /// For every queue whose hit count since the last trim is under half
    /// its capacity, frees the oldest half back to the arena. Gentle decay
    /// so idle size classes don't hold memory forever.
    pub fn trim(&mut self) {
        for cache in self.small.iter_mut() {
            Self::trim_one(cache, &self.arena);
        }
        for slot in self.normal.iter_mut().flatten() {
            Self::trim_one(slot, &self.arena);
        }
    }

    fn trim_one(cache: &mut SizeClassCache, arena: &Arena) {
        let capacity = cache.queue.capacity();
        if (cache.allocations_since_trim as usize) < capacity / 2 {
            let to_free = cache.queue.len() / 2;
            for _ in 0..to_free {
                if let Some(v) = cache.queue.pop() {
                    let _ = arena.free(v);
                }
            }
        }
        cache.allocations_since_trim = 0;
    }

    fn free_all(&mut self) {
        for cache in self.small.iter_mut() {
            while let Some(v) = cache.queue.pop() {
                let _ = self.arena.free(v);
            }
        }
        for slot in self.normal.iter_mut().flatten() {
            while let Some(v) = slot.queue.pop() {
                let _ = self.arena.free(v);
            }
        }
    }
}

impl Drop for ThreadCache {
    fn drop(&mut self) {
        self.free_all();
        self.arena.unbind_thread();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::arena::ArenaKind;
    use crate::memory::config::PoolConfig;
    use crate::memory::region::HeapRegionProvider;

    fn test_setup() -> (Arc<Arena>, Arc<SizeClasses>) {
        let config = Arc::new(PoolConfig::default());
        let sc = Arc::new(SizeClasses::new(config.page_size, config.chunk_size(), 0));
        let arena = Arc::new(Arena::new(0, ArenaKind::Heap, Box::new(HeapRegionProvider), sc.clone(), config));
        (arena, sc)
    }

    #[test]
    fn miss_then_add_then_hit() {
        let (arena, sc) = test_setup();
        let mut tc = ThreadCache::new(arena.clone(), &sc, 256, 64, 32 * 1024, 8192);
        let si = sc.size2size_idx(256);
        assert!(tc.allocate(&sc, si).is_none());

        let view = arena.allocate(256, 1024).unwrap();
        assert!(tc.add(&sc, view));
        let hit = tc.allocate(&sc, si).expect("cached entry should be returned");
        assert_eq!(hit.handle, view.handle);
    }

    #[test]
    fn rejects_entries_from_a_different_arena() {
        let (arena, sc) = test_setup();
        let mut tc = ThreadCache::new(arena.clone(), &sc, 256, 64, 32 * 1024, 8192);
        let mut view = arena.allocate(256, 1024).unwrap();
        view.arena = 99;
        assert!(!tc.add(&sc, view));
    }

    #[test]
    fn drop_returns_all_entries_to_the_arena() {
        let (arena, sc) = test_setup();
        {
            let mut tc = ThreadCache::new(arena.clone(), &sc, 256, 64, 32 * 1024, 8192);
            let view = arena.allocate(256, 1024).unwrap();
            assert!(tc.add(&sc, view));
        }
        assert_eq!(arena.active_bytes(), 0);
    }

    #[test]
    fn oversized_normal_allocations_are_not_cacheable() {
        let (arena, sc) = test_setup();
        let mut tc = ThreadCache::new(arena.clone(), &sc, 256, 64, 32 * 1024, 8192);
        let view = arena.allocate(1024 * 1024, 2 * 1024 * 1024).unwrap();
        assert!(!tc.add(&sc, view));
        arena.free(view).unwrap();
    }
}
