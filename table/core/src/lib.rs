//! table-core: bucket-sharded concurrent embedding table with tiered value storage.
//!
//! This crate provides a capacity-bounded key-value table for fixed-width
//! vector values addressed by integer keys:
//!
//! - **Table**: batched find / insert / assign / erase executed in parallel
//! - **Buckets**: fixed-capacity slot groups with a cached minimum meta
//! - **Locks**: one spin lock per bucket, no lock-free reads
//! - **Eviction**: per-bucket minimum-meta victim selection with an admission rule
//! - **Tiers**: value slices placed in a budget-limited device tier, then pinned host memory
//! - **Persistence**: chunked save/load through a `KvFile` adapter
//!
//! # Architecture
//!
//! ```text
//!            keys ──hash──> bucket index + start slot
//!                                 |
//!                                 v
//!      +-----------+     +-------------------+     +------------------+
//!      |  locks[i] |---->|    buckets[i]     |---->|  value slice     |
//!      | spin lock |     | keys, metas, min  |     | (device | host)  |
//!      +-----------+     +-------------------+     +------------------+
//!                                 |
//!                       full? evict min_meta slot
//! ```
//!
//! # Example
//!
//! ```ignore
//! use table_core::*;
//!
//! let table: Table<u64, f32> = Table::builder()
//!     .init_capacity(1 << 20)
//!     .dim(16)
//!     .max_hbm_for_vectors(256 * 1024 * 1024)
//!     .build()?;
//!
//! table.insert_or_assign(&keys, &vectors, None)?;
//! let result = table.find(&keys);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

// Core types
mod element;
mod error;
mod sync;

pub use element::{Key, Meta, Value};
pub use error::{TableError, TableResult};

// Memory
mod region;
mod tier;

pub use region::{AllocatedPageSize, HugepageSize, Region, allocate_device, allocate_pinned};
pub use tier::{SliceHandle, Tier, TierAllocator, TierUsage};

// Buckets and locking
mod bucket;
mod eviction;
mod lock;

pub use bucket::{Bucket, Victim};
pub use eviction::{Admission, EraseStatus, InsertStatus};
pub use lock::{BucketGuard, BucketLockTable};

// Table
mod hasher;
mod metrics;
mod persistence;
mod table;

pub use hasher::{DefaultKeyHasher, KeyHasher};
pub use metrics::{AtomicCounters, CounterSnapshot, TableMetrics};
pub use persistence::{
    FILE_MAGIC, FILE_VERSION, HEADER_SIZE, KvFile, KvFileHeader, LocalKvFile, MemoryKvFile,
};
pub use table::{Entries, FindResult, MAX_STALLED_WRITES, Table, TableBuilder};
