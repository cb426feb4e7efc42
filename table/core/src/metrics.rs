//! Table metrics and statistics.
//!
//! - [`AtomicCounters`] - lock-free operation counters shared by all threads
//! - [`CounterSnapshot`] - point-in-time copy of the counters
//! - [`TableMetrics`] - counters plus occupancy and per-tier memory

use crate::tier::TierUsage;
use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters for tracking table operations.
///
/// Counters are updated with relaxed ordering and are only approximately
/// consistent with each other while operations are in flight.
#[derive(Debug, Default)]
pub struct AtomicCounters {
    /// Keys looked up.
    pub finds: AtomicU64,
    /// Lookups that found the key.
    pub hits: AtomicU64,
    /// Lookups that missed.
    pub misses: AtomicU64,
    /// Keys stored in a free slot.
    pub inserts: AtomicU64,
    /// Keys overwritten in place.
    pub updates: AtomicU64,
    /// Entries evicted to make room.
    pub evictions: AtomicU64,
    /// Insertions refused by the admission rule.
    pub rejections: AtomicU64,
    /// Keys erased.
    pub erases: AtomicU64,
    /// Completed resizes.
    pub resizes: AtomicU64,
}

impl AtomicCounters {
    /// Create new atomic counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a lookup.
    #[inline]
    pub fn record_find(&self, hit: bool) {
        self.finds.fetch_add(1, Ordering::Relaxed);
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record the outcome of one insertion.
    #[inline]
    pub fn record_insert(&self, status: crate::InsertStatus) {
        use crate::InsertStatus::*;
        let counter = match status {
            Inserted => &self.inserts,
            Updated => &self.updates,
            Evicted => &self.evictions,
            Rejected => &self.rejections,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record erased keys.
    #[inline]
    pub fn record_erase(&self, count: u64) {
        if count > 0 {
            self.erases.fetch_add(count, Ordering::Relaxed);
        }
    }

    /// Record a completed resize.
    #[inline]
    pub fn record_resize(&self) {
        self.resizes.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot the current counter values.
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            finds: self.finds.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
            updates: self.updates.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
            erases: self.erases.load(Ordering::Relaxed),
            resizes: self.resizes.load(Ordering::Relaxed),
        }
    }

    /// Reset all counters to zero.
    pub fn reset(&self) {
        self.finds.store(0, Ordering::Relaxed);
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.inserts.store(0, Ordering::Relaxed);
        self.updates.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
        self.rejections.store(0, Ordering::Relaxed);
        self.erases.store(0, Ordering::Relaxed);
        self.resizes.store(0, Ordering::Relaxed);
    }
}

/// Snapshot of counter values at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    /// Keys looked up.
    pub finds: u64,
    /// Lookups that found the key.
    pub hits: u64,
    /// Lookups that missed.
    pub misses: u64,
    /// Keys stored in a free slot.
    pub inserts: u64,
    /// Keys overwritten in place.
    pub updates: u64,
    /// Entries evicted to make room.
    pub evictions: u64,
    /// Insertions refused by the admission rule.
    pub rejections: u64,
    /// Keys erased.
    pub erases: u64,
    /// Completed resizes.
    pub resizes: u64,
}

impl CounterSnapshot {
    /// Get hit rate as a percentage (0.0 - 100.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }

    /// Total insertion attempts.
    pub fn insert_attempts(&self) -> u64 {
        self.inserts + self.updates + self.evictions + self.rejections
    }

    /// Compute the difference between two snapshots (self - other).
    ///
    /// Useful for computing rates over an interval.
    pub fn diff(&self, other: &CounterSnapshot) -> CounterSnapshot {
        CounterSnapshot {
            finds: self.finds.saturating_sub(other.finds),
            hits: self.hits.saturating_sub(other.hits),
            misses: self.misses.saturating_sub(other.misses),
            inserts: self.inserts.saturating_sub(other.inserts),
            updates: self.updates.saturating_sub(other.updates),
            evictions: self.evictions.saturating_sub(other.evictions),
            rejections: self.rejections.saturating_sub(other.rejections),
            erases: self.erases.saturating_sub(other.erases),
            resizes: self.resizes.saturating_sub(other.resizes),
        }
    }
}

/// Metrics for a whole table.
#[derive(Debug, Clone, Copy, Default)]
pub struct TableMetrics {
    /// Operation counters.
    pub counters: CounterSnapshot,
    /// Number of stored entries.
    pub size: usize,
    /// Total number of slots.
    pub capacity: usize,
    /// Number of buckets.
    pub buckets: usize,
    /// Value memory per tier.
    pub tiers: TierUsage,
    /// Device budget not yet allocated.
    pub remaining_hbm: usize,
}

impl TableMetrics {
    /// Occupancy as a fraction of capacity.
    pub fn load_factor(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            self.size as f64 / self.capacity as f64
        }
    }
}
