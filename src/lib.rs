// Pooled byte-buffer allocator
//
// A high-throughput, multi-arena, thread-caching memory pool for
// fixed-lifetime byte buffers, built for network I/O frameworks that
// allocate and release buffers of arbitrary size on the hot path without
// per-operation calls to the system allocator.
//
// See `memory` for the allocator core and its public façade.

pub mod error;
pub mod memory;

pub use error::{PoolError, Result};
pub use memory::{AllocatorFacade, BufferView, PoolConfig};
