//! Error types for the pooled allocator.
//!
//! Mirrors the donor crate's flat `thiserror`-derived error enum with a
//! `Result<T>` alias, trimmed to the kinds the allocator core can actually
//! produce (spec §7).

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// Bad combination of `page_size`/`max_order`/alignment at construction time.
    #[error("invalid pool configuration: {0}")]
    ConfigInvalid(String),

    /// The system allocator refused a new chunk or an unpooled (huge) region.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// `min_new_cap > max_cap` on a reallocation request.
    #[error("capacity exceeded: requested {requested}, max {max}")]
    CapacityExceeded { requested: usize, max: usize },

    /// Request size is negative-equivalent or exceeds the allocator's hard limit.
    #[error("size out of range: {0}")]
    SizeOutOfRange(String),

    /// An internal invariant was violated (e.g. double free). Callers that
    /// observe this should treat it as a fatal bug: the detecting code path
    /// logs via `tracing::error!` and panics rather than returning this to
    /// a caller in release builds, but it is kept as a typed variant so
    /// tests can assert the condition was detected before the panic.
    #[error("internal invariant violated: {0}")]
    InvariantViolated(String),
}

pub type Result<T> = std::result::Result<T, PoolError>;
