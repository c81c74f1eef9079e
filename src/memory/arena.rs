//! Arena (spec §3, §4.8 — component C8).
//!
//! Owns a chunk slab, the six usage-band chunk lists (C7), and a 512-way
//! subpage free-list array, all behind one mutex. Spec §5 calls for a
//! second, finer-grained "subpage-size sentinel" mutex taken before the
//! arena mutex for subpage creation/allocation; this implementation
//! collapses both into the single arena mutex (documented as a deliberate
//! simplification — see `DESIGN.md`), since safely sharing a chunk's
//! subpage array between two independently-lockable structures would
//! require unsafe aliasing to express in Rust. The fast path this
//! collapse must preserve — thread-cache hits never touch any lock — is
//! untouched, since it lives entirely in `ThreadCache` above this type.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{PoolError, Result};
use crate::memory::chunk::{Chunk, FreeEffect};
use crate::memory::chunk_list::{self, NUM_BANDS};
use crate::memory::config::PoolConfig;
use crate::memory::handle::{self, HANDLE_NONE};
use crate::memory::region::{Region, RegionProvider};
use crate::memory::size_class::SizeClasses;
use crate::memory::subpage::{ChunkId, SubpageKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArenaKind {
    Heap,
    Direct,
}

/// Where a `BufferView`'s bytes live: a run/subpage inside a pooled chunk,
/// or a standalone unpooled ("huge") region (spec §4.8 "Huge" path).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocKind {
    Pooled { chunk: ChunkId },
    Huge { id: usize },
}

/// Everything the allocator hands back to the user layer for one live
/// allocation (spec §6 `BufferView`).
#[derive(Debug, Clone, Copy)]
pub struct BufferView {
    pub kind: AllocKind,
    pub handle: u64,
    pub offset: usize,
    pub length: usize,
    pub max_length: usize,
    pub arena: usize,
    pub size_idx: usize,
}

struct ArenaInner {
    chunks: Vec<Option<Chunk>>,
    free_chunk_ids: Vec<ChunkId>,
    bands: [VecDeque<ChunkId>; NUM_BANDS],
    /// One free-list deque per subpage size index, front = most recently
    /// head-inserted (spec §4.6: "head-insert after the sentinel").
    subpage_free_lists: Vec<VecDeque<SubpageKey>>,
    huge: Vec<Option<Region>>,
    free_huge_ids: Vec<usize>,
    allocations_normal: u64,
    deallocations_normal: u64,
    active_bytes: u64,
}

impl ArenaInner {
    fn new(n_subpage_sizes: usize) -> Self {
        Self {
            chunks: Vec::new(),
            free_chunk_ids: Vec::new(),
            bands: std::array::from_fn(|_| VecDeque::new()),
            subpage_free_lists: vec![VecDeque::new(); n_subpage_sizes],
            huge: Vec::new(),
            free_huge_ids: Vec::new(),
            allocations_normal: 0,
            deallocations_normal: 0,
            active_bytes: 0,
        }
    }

    fn insert_chunk(&mut self, chunk: Chunk) -> ChunkId {
        if let Some(id) = self.free_chunk_ids.pop() {
            self.chunks[id] = Some(chunk);
            id
        } else {
            self.chunks.push(Some(chunk));
            self.chunks.len() - 1
        }
    }

    fn chunk(&self, id: ChunkId) -> &Chunk {
        self.chunks[id].as_ref().expect("chunk id must be live")
    }

    fn chunk_mut(&mut self, id: ChunkId) -> &mut Chunk {
        self.chunks[id].as_mut().expect("chunk id must be live")
    }

    fn destroy_chunk(&mut self, id: ChunkId, provider: &dyn RegionProvider) {
        if let Some(chunk) = self.chunks[id].take() {
            provider.destroy(chunk.into_region());
            self.free_chunk_ids.push(id);
        }
    }
}

pub struct Arena {
    pub id: usize,
    pub kind: ArenaKind,
    provider: Box<dyn RegionProvider>,
    size_classes: Arc<SizeClasses>,
    config: Arc<PoolConfig>,
    inner: Mutex<ArenaInner>,
    num_thread_caches: AtomicUsize,
    allocations_small: AtomicU64,
    deallocations_small: AtomicU64,
    allocations_huge: AtomicU64,
    deallocations_huge: AtomicU64,
}

impl Arena {
    pub fn new(
        id: usize,
        kind: ArenaKind,
        provider: Box<dyn RegionProvider>,
        size_classes: Arc<SizeClasses>,
        config: Arc<PoolConfig>,
    ) -> Self {
        let n_subpages = size_classes.n_subpages();
        Self {
            id,
            kind,
            provider,
            size_classes,
            config,
            inner: Mutex::new(ArenaInner::new(n_subpages)),
            num_thread_caches: AtomicUsize::new(0),
            allocations_small: AtomicU64::new(0),
            deallocations_small: AtomicU64::new(0),
            allocations_huge: AtomicU64::new(0),
            deallocations_huge: AtomicU64::new(0),
        }
    }

    pub fn num_thread_caches(&self) -> usize {
        self.num_thread_caches.load(Ordering::Relaxed)
    }

    pub fn bind_thread(&self) {
        self.num_thread_caches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn unbind_thread(&self) {
        self.num_thread_caches.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn size_classes(&self) -> &SizeClasses {
        &self.size_classes
    }

    /// Routes a request by normalized size index: Small -> subpage path,
    /// Normal -> run path, out of range -> Huge (spec §4.8 "Allocation
    /// routing"). Thread-cache lookups happen one layer up, in the façade.
    pub fn allocate(&self, req_cap: usize, max_cap: usize) -> Result<BufferView> {
        let si = self.size_classes.size2size_idx(req_cap.max(1) as u64);
        if si >= self.size_classes.n_sizes() {
            return self.allocate_huge(req_cap, max_cap);
        }
        if self.size_classes.is_subpage(si) {
            self.allocate_small(si, max_cap)
        } else {
            self.allocate_normal(si, max_cap)
        }
    }

    fn allocate_small(&self, si: usize, max_cap: usize) -> Result<BufferView> {
        let elem_size = self.size_classes.size_idx2size(si) as u32;
        let mut inner = self.inner.lock();

        if let Some(&key) = inner.subpage_free_lists[si].front() {
            let (chunk_id, run_offset) = key;
            let (maybe_h, became_full) = {
                let subpage = inner.chunk_mut(chunk_id).subpage_mut(run_offset).expect("listed subpage must exist");
                let h = subpage.allocate();
                let full = subpage.just_became_full();
                (h, full)
            };
            if let Some(h) = maybe_h {
                if became_full {
                    inner.subpage_free_lists[si].pop_front();
                }
                self.allocations_small.fetch_add(1, Ordering::Relaxed);
                inner.active_bytes += elem_size as u64;
                return Ok(BufferView {
                    kind: AllocKind::Pooled { chunk: chunk_id },
                    handle: h,
                    offset: (run_offset as usize) * self.size_classes.page_size() + handle::bitmap_idx(h) as usize * elem_size as usize,
                    length: elem_size as usize,
                    max_length: max_cap,
                    arena: self.id,
                    size_idx: si,
                });
            }
        }

        // No usable subpage: allocate a fresh run and subpage for this size.
        let (chunk_id, h) = self.allocate_fresh_subpage(&mut inner, si, elem_size)?;
        inner.subpage_free_lists[si].push_front((chunk_id, handle::run_offset(h)));
        self.allocations_small.fetch_add(1, Ordering::Relaxed);
        inner.active_bytes += elem_size as u64;
        Ok(BufferView {
            kind: AllocKind::Pooled { chunk: chunk_id },
            handle: h,
            offset: (handle::run_offset(h) as usize) * self.size_classes.page_size() + handle::bitmap_idx(h) as usize * elem_size as usize,
            length: elem_size as usize,
            max_length: max_cap,
            arena: self.id,
            size_idx: si,
        })
    }

    fn allocate_fresh_subpage(&self, inner: &mut ArenaInner, _si: usize, elem_size: u32) -> Result<(ChunkId, u64)> {
        for &band in &chunk_list::NORMAL_ALLOC_ORDER {
            if let Some(id) = self.first_fit_in_band(inner, band, elem_size as u64) {
                if let Some((h, _key)) = inner.chunk_mut(id).allocate_subpage(&self.size_classes, elem_size) {
                    self.post_allocate_migration(inner, id, band);
                    return Ok((id, h));
                }
            }
        }
        let id = self.new_chunk(inner)?;
        let (h, _key) = inner
            .chunk_mut(id)
            .allocate_subpage(&self.size_classes, elem_size)
            .ok_or_else(|| PoolError::OutOfMemory("fresh chunk could not host requested subpage".into()))?;
        inner.bands[chunk_list::QINIT].push_back(id);
        inner.chunk_mut(id).band = chunk_list::QINIT;
        self.post_allocate_migration(inner, id, chunk_list::QINIT);
        Ok((id, h))
    }

    fn allocate_normal(&self, si: usize, max_cap: usize) -> Result<BufferView> {
        let size = self.size_classes.size_idx2size(si);
        let pages = (size / self.size_classes.page_size() as u64) as u32;
        let mut inner = self.inner.lock();

        for &band in &chunk_list::NORMAL_ALLOC_ORDER {
            if let Some(id) = self.first_fit_in_band(&inner, band, size) {
                let h = inner.chunk_mut(id).allocate_run(&self.size_classes, pages);
                if h != HANDLE_NONE {
                    self.post_allocate_migration(&mut inner, id, band);
                    inner.allocations_normal += 1;
                    inner.active_bytes += size;
                    return Ok(BufferView {
                        kind: AllocKind::Pooled { chunk: id },
                        handle: h,
                        offset: handle::run_offset(h) as usize * self.size_classes.page_size(),
                        length: size as usize,
                        max_length: max_cap,
                        arena: self.id,
                        size_idx: si,
                    });
                }
            }
        }

        let id = self.new_chunk(&mut inner)?;
        let h = inner.chunk_mut(id).allocate_run(&self.size_classes, pages);
        if h == HANDLE_NONE {
            return Err(PoolError::OutOfMemory(format!(
                "fresh chunk cannot host a {size}-byte run"
            )));
        }
        inner.bands[chunk_list::QINIT].push_back(id);
        inner.chunk_mut(id).band = chunk_list::QINIT;
        self.post_allocate_migration(&mut inner, id, chunk_list::QINIT);
        inner.allocations_normal += 1;
        inner.active_bytes += size;
        Ok(BufferView {
            kind: AllocKind::Pooled { chunk: id },
            handle: h,
            offset: handle::run_offset(h) as usize * self.size_classes.page_size(),
            length: size as usize,
            max_length: max_cap,
            arena: self.id,
            size_idx: si,
        })
    }

    fn first_fit_in_band(&self, inner: &ArenaInner, band: usize, size: u64) -> Option<ChunkId> {
        let thresholds = chunk_list::band_thresholds(self.size_classes.chunk_size());
        if size as usize > thresholds[band].max_capacity {
            return None;
        }
        inner.bands[band].iter().copied().find(|&id| {
            let c = inner.chunk(id);
            c.free_bytes() as u64 >= size
        })
    }

    /// After an allocation shrinks a chunk's `free_bytes`, migrate it
    /// forward if it crossed its band's `free_min_threshold` (spec §4.7).
    fn post_allocate_migration(&self, inner: &mut ArenaInner, id: ChunkId, band: usize) {
        let thresholds = chunk_list::band_thresholds(self.size_classes.chunk_size());
        let free = inner.chunk(id).free_bytes();
        if free <= thresholds[band].free_min_threshold {
            if let Some(next) = chunk_list::next_band(band) {
                Self::remove_from_band(inner, band, id);
                inner.bands[next].push_back(id);
                inner.chunk_mut(id).band = next;
            }
        }
    }

    /// After a free grows a chunk's `free_bytes`, migrate it backward,
    /// recursively, until its band's `free_max_threshold` is respected, or
    /// destroy it if it falls off the bottom of the chain (spec §4.7).
    fn post_free_migration(&self, inner: &mut ArenaInner, id: ChunkId) {
        loop {
            let band = inner.chunk(id).band;
            let thresholds = chunk_list::band_thresholds(self.size_classes.chunk_size());
            let free = inner.chunk(id).free_bytes();
            if free <= thresholds[band].free_max_threshold {
                return;
            }
            match chunk_list::prev_band(band) {
                Some(prev) if prev == band => return, // qInit self-loop
                Some(prev) => {
                    Self::remove_from_band(inner, band, id);
                    inner.bands[prev].push_back(id);
                    inner.chunk_mut(id).band = prev;
                }
                None => {
                    Self::remove_from_band(inner, band, id);
                    inner.destroy_chunk(id, self.provider.as_ref());
                    return;
                }
            }
        }
    }

    fn remove_from_band(inner: &mut ArenaInner, band: usize, id: ChunkId) {
        if let Some(pos) = inner.bands[band].iter().position(|&c| c == id) {
            inner.bands[band].remove(pos);
        }
    }

    fn new_chunk(&self, inner: &mut ArenaInner) -> Result<ChunkId> {
        let region = self.provider.new_chunk(self.size_classes.chunk_size())?;
        let chunk = Chunk::new(0, region, &self.size_classes);
        let id = inner.insert_chunk(chunk);
        inner.chunk_mut(id).id = id;
        Ok(id)
    }

    fn allocate_huge(&self, req_cap: usize, max_cap: usize) -> Result<BufferView> {
        if req_cap > max_cap {
            return Err(PoolError::CapacityExceeded {
                requested: req_cap,
                max: max_cap,
            });
        }
        let alignment = self.config.direct_memory_cache_alignment;
        let region = self.provider.new_unpooled(req_cap, alignment)?;
        let len = region.len();
        let mut inner = self.inner.lock();
        let id = if let Some(id) = inner.free_huge_ids.pop() {
            inner.huge[id] = Some(region);
            id
        } else {
            inner.huge.push(Some(region));
            inner.huge.len() - 1
        };
        inner.active_bytes += len as u64;
        self.allocations_huge.fetch_add(1, Ordering::Relaxed);
        Ok(BufferView {
            kind: AllocKind::Huge { id },
            handle: HANDLE_NONE,
            offset: 0,
            length: len,
            max_length: max_cap,
            arena: self.id,
            size_idx: self.size_classes.n_sizes(),
        })
    }

    pub fn free(&self, view: BufferView) -> Result<()> {
        match view.kind {
            AllocKind::Huge { id } => {
                let mut inner = self.inner.lock();
                let region = inner.huge[id].take().ok_or_else(|| {
                    PoolError::InvariantViolated(format!("double free of huge region {id}"))
                })?;
                inner.free_huge_ids.push(id);
                inner.active_bytes = inner.active_bytes.saturating_sub(region.len() as u64);
                self.provider.destroy(region);
                self.deallocations_huge.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            AllocKind::Pooled { chunk } => {
                let mut inner = self.inner.lock();
                let is_subpage = handle::is_subpage(view.handle);
                let si = view.size_idx;
                let alone = is_subpage && inner.subpage_free_lists[si].len() == 1
                    && inner.subpage_free_lists[si].front() == Some(&(chunk, handle::run_offset(view.handle)));

                let effect = inner.chunk_mut(chunk).free(&self.size_classes, view.handle, alone)?;
                inner.active_bytes = inner.active_bytes.saturating_sub(view.length as u64);

                match effect {
                    FreeEffect::SubpageStays => {
                        self.deallocations_small.fetch_add(1, Ordering::Relaxed);
                    }
                    FreeEffect::SubpageReinsert(key) => {
                        inner.subpage_free_lists[si].push_front(key);
                        self.deallocations_small.fetch_add(1, Ordering::Relaxed);
                    }
                    FreeEffect::SubpageReleased(key) => {
                        if let Some(pos) = inner.subpage_free_lists[si].iter().position(|&k| k == key) {
                            inner.subpage_free_lists[si].remove(pos);
                        }
                        self.deallocations_small.fetch_add(1, Ordering::Relaxed);
                        self.post_free_migration(&mut inner, chunk);
                    }
                    FreeEffect::RunFreed => {
                        inner.deallocations_normal += 1;
                        self.post_free_migration(&mut inner, chunk);
                    }
                }
                Ok(())
            }
        }
    }

    /// §4.8 "Reallocation": allocate fresh storage for `new_cap`, copy
    /// `min(old_len, new_len)` bytes across via the region provider's copy
    /// hook, optionally free the old region. The two regions being copied
    /// may be the same chunk, different chunks, or a mix of pooled/huge;
    /// rather than borrow both simultaneously out of the same chunk slab
    /// (which needs unsafe aliasing to express safely), the old bytes are
    /// staged through an owned buffer first.
    pub fn reallocate(&self, view: BufferView, new_cap: usize, free_old: bool) -> Result<(BufferView, usize)> {
        if new_cap > view.max_length {
            return Err(PoolError::CapacityExceeded {
                requested: new_cap,
                max: view.max_length,
            });
        }
        let new_view = self.allocate(new_cap, view.max_length)?;
        let copy_len = view.length.min(new_view.length);
        if copy_len > 0 {
            let mut inner = self.inner.lock();
            let mut staged = vec![0u8; copy_len];
            {
                let src_region = match view.kind {
                    AllocKind::Pooled { chunk } => inner.chunk(chunk).region(),
                    AllocKind::Huge { id } => inner.huge[id].as_ref().expect("huge id must be live"),
                };
                staged.copy_from_slice(src_region.slice(view.offset, copy_len));
            }
            let staged_region = Region::Heap(staged);
            let dst_region = match new_view.kind {
                AllocKind::Pooled { chunk } => inner.chunk_mut(chunk).region_mut(),
                AllocKind::Huge { id } => inner.huge[id].as_mut().expect("huge id must be live"),
            };
            self.provider.copy(dst_region, new_view.offset, &staged_region, 0, copy_len);
        }
        if free_old {
            self.free(view)?;
        }
        Ok((new_view, copy_len))
    }

    pub fn with_bytes<R>(&self, view: &BufferView, f: impl FnOnce(&[u8]) -> R) -> R {
        let inner = self.inner.lock();
        let region = match view.kind {
            AllocKind::Pooled { chunk } => inner.chunk(chunk).region(),
            AllocKind::Huge { id } => inner.huge[id].as_ref().expect("huge id must be live"),
        };
        f(region.slice(view.offset, view.length))
    }

    pub fn with_bytes_mut<R>(&self, view: &BufferView, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut inner = self.inner.lock();
        let region = match view.kind {
            AllocKind::Pooled { chunk } => inner.chunk_mut(chunk).region_mut(),
            AllocKind::Huge { id } => inner.huge[id].as_mut().expect("huge id must be live"),
        };
        f(region.slice_mut(view.offset, view.length))
    }

    pub fn active_bytes(&self) -> u64 {
        self.inner.lock().active_bytes
    }

    pub fn counters(&self) -> ArenaCounters {
        let inner = self.inner.lock();
        ArenaCounters {
            allocations_small: self.allocations_small.load(Ordering::Relaxed),
            allocations_normal: inner.allocations_normal,
            allocations_huge: self.allocations_huge.load(Ordering::Relaxed),
            deallocations_small: self.deallocations_small.load(Ordering::Relaxed),
            deallocations_normal: inner.deallocations_normal,
            deallocations_huge: self.deallocations_huge.load(Ordering::Relaxed),
            active_bytes: inner.active_bytes,
            num_chunks: inner.chunks.iter().filter(|c| c.is_some()).count(),
            num_thread_caches: self.num_thread_caches(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ArenaCounters {
    pub allocations_small: u64,
    pub allocations_normal: u64,
    pub allocations_huge: u64,
    pub deallocations_small: u64,
    pub deallocations_normal: u64,
    pub deallocations_huge: u64,
    pub active_bytes: u64,
    pub num_chunks: usize,
    pub num_thread_caches: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::region::HeapRegionProvider;

    fn test_arena() -> Arena {
        let config = Arc::new(PoolConfig::default());
        let sc = Arc::new(SizeClasses::new(config.page_size, config.chunk_size(), 0));
        Arena::new(0, ArenaKind::Heap, Box::new(HeapRegionProvider), sc, config)
    }

    #[test]
    fn small_allocate_then_free_returns_chunk_to_empty() {
        let arena = test_arena();
        let view = arena.allocate(256, 1024).unwrap();
        assert_eq!(view.length, 256);
        arena.free(view).unwrap();
        let counters = arena.counters();
        assert_eq!(counters.active_bytes, 0);
    }

    #[test]
    fn normal_allocate_and_free_round_trips() {
        let arena = test_arena();
        let view = arena.allocate(64 * 1024, 128 * 1024).unwrap();
        assert!(view.length >= 64 * 1024);
        arena.free(view).unwrap();
        assert_eq!(arena.active_bytes(), 0);
    }

    #[test]
    fn huge_allocation_bypasses_chunks() {
        let arena = test_arena();
        let view = arena.allocate(32 * 1024 * 1024, 64 * 1024 * 1024).unwrap();
        assert!(matches!(view.kind, AllocKind::Huge { .. }));
        assert_eq!(arena.counters().num_chunks, 0);
        arena.free(view).unwrap();
        assert_eq!(arena.active_bytes(), 0);
    }

    #[test]
    fn repeated_small_allocations_promote_to_second_subpage() {
        let arena = test_arena();
        let mut views = Vec::new();
        for _ in 0..33 {
            views.push(arena.allocate(256, 1024).unwrap());
        }
        assert_eq!(arena.inner.lock().subpage_free_lists[views[0].size_idx].len(), 1);
        for v in views {
            arena.free(v).unwrap();
        }
    }

    #[test]
    fn reallocate_copies_bytes_and_frees_old_by_default() {
        let arena = test_arena();
        let view = arena.allocate(256, 4096).unwrap();
        arena.with_bytes_mut(&view, |b| b[0..4].copy_from_slice(&[1, 2, 3, 4]));
        let (new_view, copied) = arena.reallocate(view, 1024, true).unwrap();
        assert_eq!(copied, 256);
        arena.with_bytes(&new_view, |b| assert_eq!(&b[0..4], &[1, 2, 3, 4]));
        arena.free(new_view).unwrap();
    }

    #[test]
    fn double_free_is_rejected() {
        let arena = test_arena();
        let view = arena.allocate(512, 4096).unwrap();
        arena.free(view).unwrap();
        assert!(arena.free(view).is_err());
    }
}
