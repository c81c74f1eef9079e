//! Chunk allocator (spec §3, §4.5 — component C5).
//!
//! A fixed-size region subdivided into runs of pages, indexed by the
//! offset→handle map (C3) and the page-size priority queues (C4). All
//! mutation happens under the arena's mutex; this type has no internal
//! locking of its own.

use crate::error::{PoolError, Result};
use crate::memory::handle::{self, HANDLE_NONE};
use crate::memory::offset_map::OffsetMap;
use crate::memory::page_queue::PageQueue;
use crate::memory::region::Region;
use crate::memory::size_class::SizeClasses;
use crate::memory::subpage::{ChunkId, FreeOutcome, Subpage, SubpageKey};

fn gcd(a: u64, b: u64) -> u64 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

fn lcm(a: u64, b: u64) -> u64 {
    a / gcd(a, b) * b
}

/// What the arena must do to a subpage's membership in the per-size free
/// list as a result of a free. `Chunk::free` never touches the free list
/// itself — that linkage spans chunks, which only the arena can see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeEffect {
    SubpageStays,
    SubpageReinsert(SubpageKey),
    SubpageReleased(SubpageKey),
    RunFreed,
}

#[derive(Debug)]
pub struct Chunk {
    pub id: ChunkId,
    region: Region,
    chunk_size: usize,
    page_size: usize,
    free_bytes: usize,
    offset_map: OffsetMap,
    queues: Vec<PageQueue>,
    subpages: Vec<Option<Subpage>>,
    /// Current chunk-list band index (0 = qInit .. 5 = q100), maintained by
    /// the arena; purely informational at this layer.
    pub band: usize,
    /// Bounded pool of freed `BufferView`s available for reuse; mirrors the
    /// donor's NIO-buffer-view cache (spec §3 "bounded deque of reusable
    /// view objects"). Capped at 16, since Rust's BufferView is a plain
    /// value type and this only saves an allocation of bookkeeping, not a
    /// GC-pressure-relevant object.
    view_cache: Vec<u64>,
}

impl Chunk {
    pub fn new(id: ChunkId, region: Region, sc: &SizeClasses) -> Self {
        let chunk_size = sc.chunk_size();
        let page_size = sc.page_size();
        let total_pages = (chunk_size / page_size) as u32;
        let mut offset_map = OffsetMap::with_capacity(64);
        let mut queues = Vec::with_capacity(sc.n_psizes());
        for _ in 0..sc.n_psizes() {
            queues.push(PageQueue::new());
        }
        let whole = handle::pack(0, total_pages, false, false, 0);
        let pi = sc.pages2page_idx_floor(total_pages as u64);
        queues[pi].offer(whole);
        offset_map.put(0, whole);
        if total_pages > 1 {
            offset_map.put(total_pages - 1, whole);
        }
        Self {
            id,
            region,
            chunk_size,
            page_size,
            free_bytes: chunk_size,
            offset_map,
            queues,
            subpages: vec![None; total_pages as usize],
            band: 0,
            view_cache: Vec::with_capacity(16),
        }
    }

    pub fn free_bytes(&self) -> usize {
        self.free_bytes
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn region(&self) -> &Region {
        &self.region
    }

    pub fn region_mut(&mut self) -> &mut Region {
        &mut self.region
    }

    pub fn into_region(self) -> Region {
        self.region
    }

    /// `usage% = 100 - floor(freeBytes*100/chunkSize)`, special-cased so a
    /// chunk with any free bytes at all never reports 100 (spec §4.5.4).
    pub fn usage(&self) -> u32 {
        let free_pct = (self.free_bytes as u64 * 100 / self.chunk_size as u64) as u32;
        let usage = 100 - free_pct;
        if usage == 100 && self.free_bytes > 0 {
            99
        } else {
            usage
        }
    }

    pub fn cache_view(&mut self, v: u64) {
        if self.view_cache.len() < self.view_cache.capacity() {
            self.view_cache.push(v);
        }
    }

    pub fn take_cached_view(&mut self) -> Option<u64> {
        self.view_cache.pop()
    }

    /// §4.5.1 — allocate a run of `pages` pages. Returns `HANDLE_NONE` if no
    /// queue at or above the requested page index has a free run.
    ///
    /// Free runs are keyed into `queues` by `pages2pageIdxFloor` (data-model
    /// invariant (a)), so a run's bucket index is never larger than its
    /// actual page count warrants; the scan below starts at the *ceil*
    /// index `pi` for the request, which guarantees every run in a queue at
    /// or above `pi` has at least `pages` pages (`page_idx2pages` is
    /// monotonic, so `page_idx2pages(i) >= page_idx2pages(pi) >= pages` for
    /// `i >= pi`, and floor-keying guarantees `run_pages >= page_idx2pages(i)`).
    /// Keying inserts by the ceil index instead would let an undersized run
    /// land in a bucket matching a larger request and be handed out whole.
    pub fn allocate_run(&mut self, sc: &SizeClasses, pages: u32) -> u64 {
        let pi = sc.pages2page_idx(pages as u64);
        let start = if self.free_bytes == self.chunk_size {
            sc.n_psizes() - 1
        } else {
            pi
        };
        let mut found = None;
        for i in start..sc.n_psizes() {
            if !self.queues[i].is_empty() {
                found = Some(i);
                break;
            }
        }
        // The fast-path jump to the top queue can miss a smaller, still
        // sufficient, run below `pi` once the chunk is no longer pristine;
        // that can't happen here (pristine implies exactly one queue is
        // populated), but guard the general case too.
        if found.is_none() && start > pi {
            for i in pi..start {
                if !self.queues[i].is_empty() {
                    found = Some(i);
                    break;
                }
            }
        }
        let Some(qi) = found else { return HANDLE_NONE };

        let h = self.queues[qi].poll();
        let offset = handle::run_offset(h);
        let run_pages = handle::run_pages(h);
        self.offset_map.remove(offset);
        if run_pages > 1 {
            self.offset_map.remove(offset + run_pages - 1);
        }

        let head = if run_pages > pages {
            let tail_offset = offset + pages;
            let tail_pages = run_pages - pages;
            let tail = handle::pack(tail_offset, tail_pages, false, false, 0);
            let tail_qi = sc.pages2page_idx_floor(tail_pages as u64);
            self.queues[tail_qi].offer(tail);
            self.offset_map.put(tail_offset, tail);
            if tail_pages > 1 {
                self.offset_map.put(tail_offset + tail_pages - 1, tail);
            }
            handle::pack(offset, pages, true, false, 0)
        } else {
            handle::with_in_use(h, true)
        };

        self.free_bytes -= pages as usize * self.page_size;
        head
    }

    /// §4.5.2 — allocate a subpage slot for size class `elem_size`, creating
    /// a fresh subpage run if none exists at `run_offset` yet. Returns the
    /// slot handle and the subpage's key, or `None` if the chunk has no
    /// room for a new run of the required size.
    pub fn allocate_subpage(&mut self, sc: &SizeClasses, elem_size: u32) -> Option<(u64, SubpageKey)> {
        let page_size = self.page_size as u64;
        let max_elems = 1u64 << (sc.page_size().trailing_zeros() - crate::memory::config::LOG2_QUANTUM);
        let mut run_size = lcm(page_size, elem_size as u64);
        if run_size / elem_size as u64 > max_elems {
            run_size = max_elems * elem_size as u64;
            run_size = run_size.div_ceil(page_size) * page_size;
        }
        let run_pages = (run_size / page_size) as u32;

        let run_handle = self.allocate_run(sc, run_pages);
        if run_handle == HANDLE_NONE {
            return None;
        }
        let run_offset = handle::run_offset(run_handle);
        let mut subpage = Subpage::new(self.id, run_offset, run_pages, run_size as u32, elem_size);
        let slot_handle = subpage.allocate().expect("fresh subpage always has room");
        let key = subpage.key();
        self.subpages[run_offset as usize] = Some(subpage);
        Some((slot_handle, key))
    }

    pub fn subpage(&self, run_offset: u32) -> Option<&Subpage> {
        self.subpages[run_offset as usize].as_ref()
    }

    pub fn subpage_mut(&mut self, run_offset: u32) -> Option<&mut Subpage> {
        self.subpages[run_offset as usize].as_mut()
    }

    /// §4.5.3 — free a previously allocated handle. `alone_in_list` is only
    /// consulted when `h` is a subpage handle that has just become fully
    /// free: it is the arena's answer to whether this subpage is the sole
    /// entry in its size class's free list.
    pub fn free(&mut self, sc: &SizeClasses, h: u64, alone_in_list: bool) -> Result<FreeEffect> {
        if !handle::in_use(h) {
            return Err(PoolError::InvariantViolated(format!(
                "double free of handle {h:#x}: in_use bit already clear"
            )));
        }
        if handle::is_subpage(h) {
            let run_offset = handle::run_offset(h);
            let slot = handle::bitmap_idx(h);
            let subpage = self.subpages[run_offset as usize]
                .as_mut()
                .ok_or_else(|| PoolError::InvariantViolated(format!("no subpage hosted at offset {run_offset}")))?;
            if !subpage.is_allocated(slot) {
                return Err(PoolError::InvariantViolated(format!(
                    "double free of subpage slot {slot} at offset {run_offset}"
                )));
            }
            let run_pages = subpage.run_pages;
            let key = subpage.key();
            return Ok(match subpage.free(slot, alone_in_list) {
                FreeOutcome::Stays => FreeEffect::SubpageStays,
                FreeOutcome::Reinsert => FreeEffect::SubpageReinsert(key),
                FreeOutcome::Release => {
                    self.subpages[run_offset as usize] = None;
                    self.release_run(sc, run_offset, run_pages);
                    FreeEffect::SubpageReleased(key)
                }
            });
        }

        let run_offset = handle::run_offset(h);
        let run_pages = handle::run_pages(h);
        // A run handle's `in_use` bit is a plain copy taken at allocation
        // time, not a live flag on shared state, so freeing the same handle
        // twice passes the check above unless the offset→handle map is
        // consulted too: a free run already registered at `run_offset`
        // means this offset was already released back to the chunk.
        let existing = self.offset_map.get(run_offset, HANDLE_NONE);
        if existing != HANDLE_NONE && !handle::in_use(existing) {
            return Err(PoolError::InvariantViolated(format!(
                "double free of run handle {h:#x}: offset {run_offset} already free"
            )));
        }
        self.release_run(sc, run_offset, run_pages);
        Ok(FreeEffect::RunFreed)
    }

    /// §4.5.3 step 2-3 — coalesce a freed run with its neighbors and
    /// reinsert the merged run into C3/C4, adding its bytes back to
    /// `free_bytes`.
    fn release_run(&mut self, sc: &SizeClasses, mut offset: u32, mut pages: u32) {
        loop {
            if offset > 0 {
                let prev_h = self.offset_map.get(offset - 1, HANDLE_NONE);
                if prev_h != HANDLE_NONE && !handle::in_use(prev_h) {
                    let prev_offset = handle::run_offset(prev_h);
                    let prev_pages = handle::run_pages(prev_h);
                    if prev_offset + prev_pages == offset {
                        self.remove_free_run(sc, prev_h);
                        offset = prev_offset;
                        pages += prev_pages;
                        continue;
                    }
                }
            }
            let next_h = self.offset_map.get(offset + pages, HANDLE_NONE);
            if next_h != HANDLE_NONE && !handle::in_use(next_h) {
                let next_offset = handle::run_offset(next_h);
                if next_offset == offset + pages {
                    let next_pages = handle::run_pages(next_h);
                    self.remove_free_run(sc, next_h);
                    pages += next_pages;
                    continue;
                }
            }
            break;
        }

        let merged = handle::pack(offset, pages, false, false, 0);
        let qi = sc.pages2page_idx_floor(pages as u64);
        self.queues[qi].offer(merged);
        self.offset_map.put(offset, merged);
        if pages > 1 {
            self.offset_map.put(offset + pages - 1, merged);
        }
        self.free_bytes += pages as usize * self.page_size;
    }

    fn remove_free_run(&mut self, sc: &SizeClasses, h: u64) {
        let offset = handle::run_offset(h);
        let pages = handle::run_pages(h);
        let qi = sc.pages2page_idx_floor(pages as u64);
        self.queues[qi].remove(h);
        self.offset_map.remove(offset);
        if pages > 1 {
            self.offset_map.remove(offset + pages - 1);
        }
    }

    #[cfg(test)]
    pub fn free_run_count(&self) -> usize {
        self.queues.iter().filter(|q| !q.is_empty()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::region::HeapRegionProvider;

    fn sc() -> SizeClasses {
        SizeClasses::new(8192, 16 * 1024 * 1024, 0)
    }

    fn chunk(sc: &SizeClasses) -> Chunk {
        let region = HeapRegionProvider.new_chunk(sc.chunk_size()).unwrap();
        Chunk::new(0, region, sc)
    }

    #[test]
    fn fresh_chunk_is_all_free() {
        let sc = sc();
        let c = chunk(&sc);
        assert_eq!(c.free_bytes(), sc.chunk_size());
        assert_eq!(c.usage(), 0);
    }

    #[test]
    fn allocate_and_free_single_run_restores_chunk() {
        let sc = sc();
        let mut c = chunk(&sc);
        let h = c.allocate_run(&sc, 8);
        assert_ne!(h, HANDLE_NONE);
        assert!(handle::in_use(h));
        assert_eq!(c.free_bytes(), sc.chunk_size() - 8 * sc.page_size());

        let effect = c.free(&sc, h, false).unwrap();
        assert_eq!(effect, FreeEffect::RunFreed);
        assert_eq!(c.free_bytes(), sc.chunk_size());
        assert_eq!(c.free_run_count(), 1);
    }

    #[test]
    fn split_then_coalesce_two_adjacent_runs() {
        let sc = sc();
        let mut c = chunk(&sc);
        let h1 = c.allocate_run(&sc, 8);
        let h2 = c.allocate_run(&sc, 8);
        assert_eq!(handle::run_offset(h2), handle::run_offset(h1) + 8);

        c.free(&sc, h1, false).unwrap();
        assert_eq!(c.free_run_count(), 1);

        c.free(&sc, h2, false).unwrap();
        assert_eq!(c.free_bytes(), sc.chunk_size());
        assert_eq!(c.free_run_count(), 1);
    }

    #[test]
    fn subpage_allocation_then_full_free_releases_run() {
        let sc = sc();
        let mut c = chunk(&sc);
        let (slot_h, key) = c.allocate_subpage(&sc, 256).unwrap();
        assert!(handle::is_subpage(slot_h));
        assert_eq!(key.0, 0);

        // Only subpage of its size in the arena's free list.
        let effect = c.free(&sc, slot_h, true).unwrap();
        assert_eq!(effect, FreeEffect::SubpageStays);
        assert!(c.subpage(key.1).is_some());
    }

    #[test]
    fn double_free_of_run_is_invariant_violation() {
        let sc = sc();
        let mut c = chunk(&sc);
        let h = c.allocate_run(&sc, 4);
        c.free(&sc, h, false).unwrap();
        let stale = h;
        assert!(c.free(&sc, stale, false).is_err());
    }

    // Regression: a 9-page free run must be keyed by its *floor* page index
    // (8 pages) rather than its *ceil* page index (10 pages), or a request
    // for exactly 10 pages would scan straight into the 9-page run's bucket
    // and hand it out marked as a 10-page run, overlapping whatever follows
    // it in the chunk.
    #[test]
    fn undersized_free_run_is_not_handed_out_for_a_larger_request() {
        let sc = sc();
        let mut c = chunk(&sc);
        let total_pages = (sc.chunk_size() / sc.page_size()) as u32;

        // Split off everything but a 9-page tail.
        let head = c.allocate_run(&sc, total_pages - 9);
        assert_ne!(head, HANDLE_NONE);
        assert_eq!(c.free_run_count(), 1, "only the 9-page tail remains free");

        // A request for 10 pages must not be satisfied by the 9-page tail.
        let h10 = c.allocate_run(&sc, 10);
        assert_eq!(h10, HANDLE_NONE, "no free run actually has 10 pages available");

        // The 9-page tail is still intact and satisfies its own size.
        let h9 = c.allocate_run(&sc, 9);
        assert_ne!(h9, HANDLE_NONE);
        assert_eq!(handle::run_pages(h9), 9);
    }

    #[test]
    fn allocate_beyond_capacity_returns_none() {
        let sc = sc();
        let mut c = chunk(&sc);
        let max_pages = (sc.chunk_size() / sc.page_size()) as u32;
        let h = c.allocate_run(&sc, max_pages);
        assert_ne!(h, HANDLE_NONE);
        assert_eq!(c.allocate_run(&sc, 1), HANDLE_NONE);
    }
}
