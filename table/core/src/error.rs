//! Error types for table operations.
//!
//! Only table-wide failures are errors. Per-key outcomes such as a rejected
//! insertion or a missing key are reported through the batch result types
//! ([`InsertStatus`](crate::InsertStatus), [`EraseStatus`](crate::EraseStatus)).

use crate::tier::Tier;
use std::io;

/// Errors that can occur during table operations.
#[derive(Debug, thiserror::Error)]
pub enum TableError {
    /// A resize asked for more capacity than `max_size` allows.
    /// The table keeps its previous capacity.
    #[error("requested capacity {requested} exceeds max_size {max_size}")]
    CapacityExceeded {
        /// Capacity that was requested.
        requested: usize,
        /// Configured upper bound.
        max_size: usize,
    },

    /// Backing memory for value slices could not be allocated.
    #[error("failed to allocate {bytes} bytes of {tier} memory: {source}")]
    AllocationFailure {
        /// Tier the allocation was attempted in.
        tier: Tier,
        /// Size of the failed allocation.
        bytes: usize,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// A value buffer does not hold `dim` elements per key.
    #[error("dimension mismatch: expected {expected} elements per key, got {actual}")]
    DimensionMismatch {
        /// Configured dimension.
        expected: usize,
        /// Elements per key implied by the supplied buffer.
        actual: usize,
    },

    /// The value buffer length does not match the number of keys.
    #[error("key count ({keys}) doesn't match value count ({values})")]
    CountMismatch {
        /// Number of keys supplied.
        keys: usize,
        /// Number of vectors supplied.
        values: usize,
    },

    /// The meta buffer length does not match the number of keys.
    #[error("key count ({keys}) doesn't match meta count ({metas})")]
    MetaCountMismatch {
        /// Number of keys supplied.
        keys: usize,
        /// Number of metas supplied.
        metas: usize,
    },

    /// The table configuration is invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The persistence adapter returned an I/O error.
    #[error("persistence error: {0}")]
    Persistence(#[from] io::Error),

    /// The persistence adapter kept accepting zero entries.
    #[error("persistence sink stopped accepting entries after {written} entries")]
    PersistenceStalled {
        /// Entries written before the sink stalled.
        written: usize,
    },
}

/// Result type for table operations.
pub type TableResult<T> = Result<T, TableError>;
