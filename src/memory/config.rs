//! Pool-wide configuration (spec §4.10).
//!
//! A plain struct rather than a file/env reader — the spec is explicit that
//! it is agnostic about the configuration source (spec §6 "Configuration
//! surface").

use crate::error::{PoolError, Result};

pub const LOG2_QUANTUM: u32 = 4; // 16 B minimum allocation
pub const LOG2_SIZE_CLASS_GROUP: u32 = 2; // 4 size classes per octave
pub const MIN_ALLOC_SIZE: usize = 1 << LOG2_QUANTUM;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of heap arenas. 0 disables heap pooling.
    pub num_heap_arenas: usize,
    /// Number of direct (off-heap) arenas. 0 disables direct pooling.
    pub num_direct_arenas: usize,
    /// Page size in bytes, power of two, >= 4 KiB.
    pub page_size: usize,
    /// Chunk size exponent: `chunk_size = page_size << max_order`.
    pub max_order: u32,
    /// Thread-cache queue depth for Small size classes.
    pub small_cache_size: usize,
    /// Thread-cache queue depth for Normal size classes.
    pub normal_cache_size: usize,
    /// Upper bound on Normal sizes that are cacheable in a thread cache.
    pub max_cached_buffer_capacity: usize,
    /// If false, only designated thread kinds get a cache.
    pub use_cache_for_all_threads: bool,
    /// 0 or a power of two <= page_size.
    pub direct_memory_cache_alignment: usize,
    /// Number of allocations between cache trims.
    pub cache_trim_interval: u64,
    /// Optional periodic trim interval, driven by an external scheduler.
    pub cache_trim_interval_millis: Option<u64>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let cpus = num_cpus::get().max(1);
        let chunk_size: usize = 8192usize << 11; // default page_size * 2^max_order
        let max_heap = 2usize * 1024 * 1024 * 1024; // 2 GiB default ceiling
        let max_direct = 2usize * 1024 * 1024 * 1024;
        Self {
            num_heap_arenas: (2 * cpus).min((max_heap / chunk_size / 6).max(1)),
            num_direct_arenas: (2 * cpus).min((max_direct / chunk_size / 6).max(1)),
            page_size: 8192,
            max_order: 11,
            small_cache_size: 256,
            normal_cache_size: 64,
            max_cached_buffer_capacity: 32 * 1024,
            use_cache_for_all_threads: true,
            direct_memory_cache_alignment: 0,
            cache_trim_interval: 8192,
            cache_trim_interval_millis: None,
        }
    }
}

impl PoolConfig {
    pub fn chunk_size(&self) -> usize {
        self.page_size << self.max_order
    }

    pub fn page_shifts(&self) -> u32 {
        self.page_size.trailing_zeros()
    }

    /// Validates the configuration, matching spec §7's `ConfigInvalid` kind.
    pub fn validate(&self) -> Result<()> {
        if !self.page_size.is_power_of_two() || self.page_size < 4096 {
            return Err(PoolError::ConfigInvalid(format!(
                "page_size must be a power of two >= 4096, got {}",
                self.page_size
            )));
        }
        if self.max_order > 14 {
            return Err(PoolError::ConfigInvalid(format!(
                "max_order must be in 0..=14, got {}",
                self.max_order
            )));
        }
        let align = self.direct_memory_cache_alignment;
        if align != 0 && (!align.is_power_of_two() || align > self.page_size) {
            return Err(PoolError::ConfigInvalid(format!(
                "direct_memory_cache_alignment must be 0 or a power of two <= page_size, got {align}"
            )));
        }
        if self.chunk_size() > (1usize << 30) {
            return Err(PoolError::ConfigInvalid(
                "chunk_size exceeds the allocator's supported range".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        PoolConfig::default().validate().unwrap();
    }

    #[test]
    fn default_chunk_size_is_16mib() {
        assert_eq!(PoolConfig::default().chunk_size(), 16 * 1024 * 1024);
    }

    #[test]
    fn rejects_non_power_of_two_page_size() {
        let mut cfg = PoolConfig::default();
        cfg.page_size = 5000;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_bad_alignment() {
        let mut cfg = PoolConfig::default();
        cfg.direct_memory_cache_alignment = 3;
        assert!(cfg.validate().is_err());
    }
}
