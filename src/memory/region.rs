//! Region providers — the heap/direct capability seam (spec §4.8, §9).
//!
//! Heap and direct arenas differ only in four hooks: allocate a pooled
//! chunk's backing region, allocate an unpooled (huge) region, destroy a
//! region, and copy bytes between two regions of the same kind. Modeled as
//! a trait with two implementations rather than through inheritance, per
//! the design notes.

use std::alloc::{self, Layout};
use std::ptr::NonNull;

use crate::error::{PoolError, Result};

/// A contiguous block of memory owned by a single chunk (or a single huge
/// allocation). `Heap` stores bytes inline; `Direct` stores a raw pointer
/// obtained from the system allocator, freed explicitly on destroy.
#[derive(Debug)]
pub enum Region {
    Heap(Vec<u8>),
    Direct { ptr: NonNull<u8>, layout: Layout },
}

unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    pub fn len(&self) -> usize {
        match self {
            Region::Heap(v) => v.len(),
            Region::Direct { layout, .. } => layout.size(),
        }
    }

    pub fn as_ptr(&self) -> *const u8 {
        match self {
            Region::Heap(v) => v.as_ptr(),
            Region::Direct { ptr, .. } => ptr.as_ptr(),
        }
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        match self {
            Region::Heap(v) => v.as_mut_ptr(),
            Region::Direct { ptr, .. } => ptr.as_ptr(),
        }
    }

    /// Byte slice view of `[offset, offset+len)`. Panics on out-of-range,
    /// matching the allocator's internal invariant that callers only ever
    /// address bytes within a region they were handed.
    pub fn slice(&self, offset: usize, len: usize) -> &[u8] {
        match self {
            Region::Heap(v) => &v[offset..offset + len],
            Region::Direct { ptr, layout } => {
                debug_assert!(offset + len <= layout.size());
                unsafe { std::slice::from_raw_parts(ptr.as_ptr().add(offset), len) }
            }
        }
    }

    pub fn slice_mut(&mut self, offset: usize, len: usize) -> &mut [u8] {
        match self {
            Region::Heap(v) => &mut v[offset..offset + len],
            Region::Direct { ptr, layout } => {
                debug_assert!(offset + len <= layout.size());
                unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr().add(offset), len) }
            }
        }
    }
}

/// Capability trait implemented once per arena variant (spec §9 "Dynamic
/// dispatch"). All chunk/subpage/arena logic above this seam is identical
/// for heap and direct arenas.
pub trait RegionProvider: std::fmt::Debug + Send + Sync {
    /// Allocates a pooled chunk's backing region, sized exactly `chunk_size`.
    fn new_chunk(&self, chunk_size: usize) -> Result<Region>;

    /// Allocates an unpooled (huge) region, sized exactly `size`, honoring
    /// `alignment` when non-zero (direct only; heap ignores it).
    fn new_unpooled(&self, size: usize, alignment: usize) -> Result<Region>;

    /// Releases a region obtained from either constructor above. For the
    /// heap variant this is a no-op (the `Vec<u8>` drops normally); for
    /// direct it calls the system deallocator.
    fn destroy(&self, region: Region);

    /// Copies `len` bytes from `src[src_off..]` into `dst[dst_off..]`.
    fn copy(&self, dst: &mut Region, dst_off: usize, src: &Region, src_off: usize, len: usize);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct HeapRegionProvider;

impl RegionProvider for HeapRegionProvider {
    fn new_chunk(&self, chunk_size: usize) -> Result<Region> {
        Ok(Region::Heap(vec![0u8; chunk_size]))
    }

    fn new_unpooled(&self, size: usize, _alignment: usize) -> Result<Region> {
        Ok(Region::Heap(vec![0u8; size]))
    }

    fn destroy(&self, _region: Region) {}

    fn copy(&self, dst: &mut Region, dst_off: usize, src: &Region, src_off: usize, len: usize) {
        if len == 0 {
            return;
        }
        dst.slice_mut(dst_off, len).copy_from_slice(src.slice(src_off, len));
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DirectRegionProvider;

impl DirectRegionProvider {
    fn alloc(&self, size: usize, alignment: usize) -> Result<Region> {
        let align = alignment.max(std::mem::align_of::<u8>()).next_power_of_two();
        let layout = Layout::from_size_align(size.max(1), align)
            .map_err(|e| PoolError::OutOfMemory(format!("bad layout: {e}")))?;
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw)
            .ok_or_else(|| PoolError::OutOfMemory(format!("system allocator refused {size} bytes")))?;
        Ok(Region::Direct { ptr, layout })
    }
}

impl RegionProvider for DirectRegionProvider {
    fn new_chunk(&self, chunk_size: usize) -> Result<Region> {
        self.alloc(chunk_size, 0)
    }

    fn new_unpooled(&self, size: usize, alignment: usize) -> Result<Region> {
        self.alloc(size, alignment)
    }

    fn destroy(&self, region: Region) {
        if let Region::Direct { ptr, layout } = region {
            unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
        } else {
            tracing::error!("DirectRegionProvider::destroy given a non-direct region");
        }
    }

    fn copy(&self, dst: &mut Region, dst_off: usize, src: &Region, src_off: usize, len: usize) {
        if len == 0 {
            return;
        }
        unsafe {
            std::ptr::copy_nonoverlapping(
                src.as_ptr().add(src_off),
                dst.as_mut_ptr().add(dst_off),
                len,
            );
        }
    }
}
