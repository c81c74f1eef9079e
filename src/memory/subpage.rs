//! Subpage allocator (spec §3, §4.6 — component C6).
//!
//! A subpage reinterprets one run as `maxNumElems` equal-sized slots,
//! tracked by a bitmap. The donor's intrusive prev/next free-list pointers
//! are replaced with an index: the arena keeps one `VecDeque<SubpageKey>`
//! per size class and a subpage is addressed by `(owning chunk, run_offset)`
//! rather than by a raw pointer (spec §9: prefer interior indices over
//! ownership cycles). Whether a subpage is the sole member of its free list
//! — needed to decide whether an emptied subpage should be kept alive — is
//! therefore a fact the arena already has, and is passed in rather than
//! re-derived from self-referential pointers.

use crate::memory::handle;

/// Identifies a chunk within an arena's chunk slab. Defined here because a
/// subpage's free-list linkage is the first place an identifier (rather
/// than an owning reference) is needed; `chunk` re-exports it.
pub type ChunkId = usize;

/// A subpage's identity within the arena-wide free lists: which chunk it
/// lives on and which run (by page offset) it occupies.
pub type SubpageKey = (ChunkId, u32);

#[derive(Debug, Clone)]
pub struct Subpage {
    pub owner: ChunkId,
    pub run_offset: u32,
    pub run_pages: u32,
    pub elem_size: u32,
    pub max_num_elems: u32,
    pub num_avail: u32,
    bitmap: Vec<u64>,
    next_avail: Option<u32>,
    pub do_not_destroy: bool,
}

/// Outcome of `free`, telling the caller (the arena) what list surgery, if
/// any, is required.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeOutcome {
    /// Slot freed; subpage stays exactly where it is in the free list.
    Stays,
    /// Subpage was full (detached) and must be reinserted at the list head.
    Reinsert,
    /// All slots are now free and another subpage of this size exists in
    /// the free list; detach this one and release its underlying run.
    Release,
}

impl Subpage {
    pub fn key(&self) -> SubpageKey {
        (self.owner, self.run_offset)
    }

    pub fn new(owner: ChunkId, run_offset: u32, run_pages: u32, run_size: u32, elem_size: u32) -> Self {
        let max_num_elems = run_size / elem_size;
        let words = (max_num_elems as usize).div_ceil(64).max(1);
        Self {
            owner,
            run_offset,
            run_pages,
            elem_size,
            max_num_elems,
            num_avail: max_num_elems,
            bitmap: vec![0u64; words],
            next_avail: Some(0),
            do_not_destroy: true,
        }
    }

    fn bit(&self, idx: u32) -> bool {
        (self.bitmap[(idx / 64) as usize] >> (idx % 64)) & 1 != 0
    }

    fn set_bit(&mut self, idx: u32) {
        self.bitmap[(idx / 64) as usize] |= 1u64 << (idx % 64);
    }

    fn clear_bit(&mut self, idx: u32) {
        self.bitmap[(idx / 64) as usize] &= !(1u64 << (idx % 64));
    }

    pub fn is_allocated(&self, idx: u32) -> bool {
        self.bit(idx)
    }

    fn find_first_free(&self) -> Option<u32> {
        if let Some(hint) = self.next_avail {
            if hint < self.max_num_elems && !self.bit(hint) {
                return Some(hint);
            }
        }
        (0..self.max_num_elems).find(|&i| !self.bit(i))
    }

    /// Allocates a slot, returning a packed handle, or `None` if the
    /// subpage cannot serve an allocation right now.
    pub fn allocate(&mut self) -> Option<u64> {
        if self.num_avail == 0 || !self.do_not_destroy {
            return None;
        }
        let slot = self.find_first_free()?;
        self.set_bit(slot);
        self.next_avail = None;
        self.num_avail -= 1;
        Some(handle::pack(self.run_offset, self.run_pages, true, true, slot))
    }

    /// True once this allocation emptied the subpage (caller must detach
    /// it from the arena free list).
    pub fn just_became_full(&self) -> bool {
        self.num_avail == 0
    }

    /// Frees `slot_idx`, reporting what the caller must do to the free
    /// list. `alone_in_list` is the arena's answer to "is this subpage
    /// currently the only entry in its size class's free list" (spec
    /// §4.6 step 4's avoid-reallocation-churn clause).
    pub fn free(&mut self, slot_idx: u32, alone_in_list: bool) -> FreeOutcome {
        let was_full = self.num_avail == 0;
        self.clear_bit(slot_idx);
        self.next_avail = Some(slot_idx);
        self.num_avail += 1;

        if was_full {
            return FreeOutcome::Reinsert;
        }
        if self.max_num_elems == 1 {
            return FreeOutcome::Stays;
        }
        if self.num_avail < self.max_num_elems {
            return FreeOutcome::Stays;
        }
        // All slots free. Keep this subpage alive if it's the only one of
        // its size in the free list, to avoid reallocation churn.
        if alone_in_list {
            FreeOutcome::Stays
        } else {
            self.do_not_destroy = false;
            FreeOutcome::Release
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> Subpage {
        Subpage::new(0, 0, 1, 8192, 256)
    }

    #[test]
    fn allocates_until_exhausted_then_refuses() {
        let mut s = fresh();
        assert_eq!(s.max_num_elems, 32);
        let mut handles = Vec::new();
        for _ in 0..32 {
            handles.push(s.allocate().expect("slot available"));
        }
        assert!(s.just_became_full());
        assert!(s.allocate().is_none());
        assert_eq!(handles.len(), 32);
        let slots: std::collections::HashSet<u32> = handles.iter().map(|&h| handle::bitmap_idx(h)).collect();
        assert_eq!(slots.len(), 32);
    }

    #[test]
    fn free_after_full_requests_reinsert() {
        let mut s = fresh();
        for _ in 0..32 {
            s.allocate().unwrap();
        }
        assert_eq!(s.free(0, false), FreeOutcome::Reinsert);
    }

    #[test]
    fn free_to_not_all_free_stays() {
        let mut s = fresh();
        let h0 = s.allocate().unwrap();
        s.allocate().unwrap();
        let outcome = s.free(handle::bitmap_idx(h0), false);
        assert_eq!(outcome, FreeOutcome::Stays);
    }

    #[test]
    fn all_free_alone_in_list_stays() {
        let mut s = fresh();
        let h0 = s.allocate().unwrap();
        assert_eq!(s.free(handle::bitmap_idx(h0), true), FreeOutcome::Stays);
        assert!(s.do_not_destroy);
    }

    #[test]
    fn all_free_with_siblings_releases() {
        let mut s = fresh();
        let h0 = s.allocate().unwrap();
        assert_eq!(s.free(handle::bitmap_idx(h0), false), FreeOutcome::Release);
        assert!(!s.do_not_destroy);
    }

    #[test]
    fn single_slot_subpage_never_releases_on_free() {
        let mut s = Subpage::new(0, 0, 1, 8192, 8192);
        assert_eq!(s.max_num_elems, 1);
        let h = s.allocate().unwrap();
        assert_eq!(s.free(handle::bitmap_idx(h), false), FreeOutcome::Stays);
    }
}
