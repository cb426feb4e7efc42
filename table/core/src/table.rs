//! The concurrent table.
//!
//! # Structure
//!
//! ```text
//! Table
//!  ├── RwLock<Inner>                 resize barrier
//!  │    ├── Generation
//!  │    │    ├── buckets[]           keys, metas, min cache per bucket
//!  │    │    ├── values[]            per-bucket pointer into a value slice
//!  │    │    └── BucketLockTable     one spin lock per bucket
//!  │    └── TierAllocator            device/host value slices
//!  ├── KeyHasher
//!  └── AtomicCounters
//! ```
//!
//! Every key operation holds the barrier in shared mode and exactly one
//! bucket lock. Resizing holds the barrier exclusively, builds a new
//! generation and migrates all entries into it before swapping it in.

use crate::bucket::Bucket;
use crate::element::{Key, Meta, Value};
use crate::error::{TableError, TableResult};
use crate::eviction::{Admission, EraseStatus, InsertStatus};
use crate::hasher::{DefaultKeyHasher, KeyHasher};
use crate::lock::BucketLockTable;
use crate::metrics::{AtomicCounters, TableMetrics};
use crate::persistence::KvFile;
use crate::region::HugepageSize;
use crate::tier::{TierAllocator, TierUsage};
use parking_lot::RwLock;
use rayon::prelude::*;
use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info, warn};

/// Consecutive zero-entry writes tolerated before a save is abandoned.
pub const MAX_STALLED_WRITES: usize = 3;

const KB: usize = 1024;
const GB: usize = 1024 * 1024 * 1024;

/// Result of a batched lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct FindResult<V, M> {
    /// `dim` elements per key. Zero for missing keys.
    pub values: Vec<V>,
    /// Meta per key. `M::MAX` for missing keys.
    pub metas: Vec<M>,
    /// Whether each key was present.
    pub found: Vec<bool>,
}

impl<V: Value, M: Meta> FindResult<V, M> {
    fn with_len(n: usize, dim: usize) -> Self {
        Self {
            values: vec![V::default(); n * dim],
            metas: vec![M::MAX; n],
            found: vec![false; n],
        }
    }

    /// Number of keys looked up.
    pub fn len(&self) -> usize {
        self.found.len()
    }

    /// Whether the batch was empty.
    pub fn is_empty(&self) -> bool {
        self.found.is_empty()
    }

    /// Number of keys that were present.
    pub fn hits(&self) -> usize {
        self.found.iter().filter(|f| **f).count()
    }

    /// Vector of the `i`th key, if it was present.
    pub fn value(&self, i: usize) -> Option<&[V]> {
        if !self.found[i] {
            return None;
        }
        let dim = self.values.len() / self.found.len();
        Some(&self.values[i * dim..(i + 1) * dim])
    }
}

/// A set of entries copied out of the table.
#[derive(Debug, Clone, PartialEq)]
pub struct Entries<K, V, M> {
    /// Keys.
    pub keys: Vec<K>,
    /// `dim` elements per key.
    pub values: Vec<V>,
    /// Meta per key.
    pub metas: Vec<M>,
}

impl<K, V, M> Entries<K, V, M> {
    fn new() -> Self {
        Self {
            keys: Vec::new(),
            values: Vec::new(),
            metas: Vec::new(),
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether there are no entries.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    fn append(&mut self, mut other: Self) {
        self.keys.append(&mut other.keys);
        self.values.append(&mut other.values);
        self.metas.append(&mut other.metas);
    }
}

/// Builder for [`Table`].
pub struct TableBuilder<K, V, M = u64, H = DefaultKeyHasher> {
    init_capacity: usize,
    max_size: usize,
    bucket_max_size: usize,
    max_hbm_for_vectors: usize,
    dim: usize,
    max_load_factor: f64,
    max_slice_bytes: usize,
    admission: Admission,
    hugepage_size: HugepageSize,
    io_batch_size: usize,
    hasher: H,
    _types: PhantomData<fn() -> (K, V, M)>,
}

impl<K: Key, V: Value, M: Meta> TableBuilder<K, V, M, DefaultKeyHasher> {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self {
            init_capacity: 64 * KB,
            max_size: usize::MAX,
            bucket_max_size: 128,
            max_hbm_for_vectors: 0,
            dim: 64,
            max_load_factor: 0.75,
            max_slice_bytes: GB,
            admission: Admission::NotSmaller,
            hugepage_size: HugepageSize::None,
            io_batch_size: 64 * KB,
            hasher: DefaultKeyHasher::new(),
            _types: PhantomData,
        }
    }
}

impl<K: Key, V: Value, M: Meta> Default for TableBuilder<K, V, M, DefaultKeyHasher> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Key, V: Value, M: Meta, H: KeyHasher<K>> TableBuilder<K, V, M, H> {
    /// Set the initial capacity in entries (default: 64Ki).
    ///
    /// Rounded up to a power-of-two number of buckets.
    pub fn init_capacity(mut self, capacity: usize) -> Self {
        self.init_capacity = capacity;
        self
    }

    /// Set the capacity limit in entries (default: unbounded).
    pub fn max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Set the number of slots per bucket (default: 128).
    pub fn bucket_max_size(mut self, slots: usize) -> Self {
        self.bucket_max_size = slots;
        self
    }

    /// Set the device tier budget in bytes (default: 0, host only).
    pub fn max_hbm_for_vectors(mut self, bytes: usize) -> Self {
        self.max_hbm_for_vectors = bytes;
        self
    }

    /// Set the number of elements per value vector (default: 64).
    pub fn dim(mut self, dim: usize) -> Self {
        self.dim = dim;
        self
    }

    /// Set the load factor that triggers doubling (default: 0.75).
    pub fn max_load_factor(mut self, factor: f64) -> Self {
        self.max_load_factor = factor;
        self
    }

    /// Set the upper bound for one value slice in bytes (default: 1GB).
    pub fn max_slice_bytes(mut self, bytes: usize) -> Self {
        self.max_slice_bytes = bytes;
        self
    }

    /// Set the admission rule for caller-supplied metas.
    pub fn admission(mut self, admission: Admission) -> Self {
        self.admission = admission;
        self
    }

    /// Set the hugepage preference for device slices.
    ///
    /// Falls back to regular pages if hugepages are unavailable.
    pub fn hugepage_size(mut self, size: HugepageSize) -> Self {
        self.hugepage_size = size;
        self
    }

    /// Set the number of entries moved per persistence chunk (default: 64Ki).
    pub fn io_batch_size(mut self, entries: usize) -> Self {
        self.io_batch_size = entries;
        self
    }

    /// Use a custom key hasher.
    pub fn hasher<H2: KeyHasher<K>>(self, hasher: H2) -> TableBuilder<K, V, M, H2> {
        TableBuilder {
            init_capacity: self.init_capacity,
            max_size: self.max_size,
            bucket_max_size: self.bucket_max_size,
            max_hbm_for_vectors: self.max_hbm_for_vectors,
            dim: self.dim,
            max_load_factor: self.max_load_factor,
            max_slice_bytes: self.max_slice_bytes,
            admission: self.admission,
            hugepage_size: self.hugepage_size,
            io_batch_size: self.io_batch_size,
            hasher,
            _types: PhantomData,
        }
    }

    fn validate(&self) -> TableResult<()> {
        let invalid = |msg: String| Err(TableError::InvalidConfig(msg));
        if self.dim == 0 {
            return invalid("dim must be greater than 0".into());
        }
        if self.bucket_max_size == 0 {
            return invalid("bucket_max_size must be greater than 0".into());
        }
        if self.bucket_max_size > u32::MAX as usize {
            return invalid(format!("bucket_max_size {} too large", self.bucket_max_size));
        }
        if !(self.max_load_factor > 0.0 && self.max_load_factor <= 1.0) {
            return invalid(format!(
                "max_load_factor must be in (0, 1], got {}",
                self.max_load_factor
            ));
        }
        if self.init_capacity == 0 {
            return invalid("init_capacity must be greater than 0".into());
        }
        if self.init_capacity > self.max_size {
            return invalid(format!(
                "init_capacity {} exceeds max_size {}",
                self.init_capacity, self.max_size
            ));
        }
        if self.io_batch_size == 0 {
            return invalid("io_batch_size must be greater than 0".into());
        }
        Ok(())
    }

    /// Build the table, allocating storage for the initial capacity.
    pub fn build(self) -> TableResult<Table<K, V, M, H>> {
        self.validate()?;

        let bucket_bytes = self
            .bucket_max_size
            .checked_mul(self.dim)
            .and_then(|n| n.checked_mul(std::mem::size_of::<V>()))
            .ok_or_else(|| TableError::InvalidConfig("bucket value size overflows".into()))?;
        let num_buckets = self
            .init_capacity
            .div_ceil(self.bucket_max_size)
            .checked_next_power_of_two()
            .filter(|&n| {
                n.checked_mul(self.bucket_max_size).is_some() && n.checked_mul(bucket_bytes).is_some()
            })
            .ok_or(TableError::CapacityExceeded {
                requested: self.init_capacity,
                max_size: self.max_size,
            })?;

        let mut allocator = TierAllocator::new(
            bucket_bytes,
            self.max_slice_bytes,
            self.max_hbm_for_vectors,
            self.hugepage_size,
        );
        allocator.grow_to(num_buckets)?;

        let generation = Generation::new(num_buckets, self.bucket_max_size, &allocator);
        let usage = allocator.usage();
        debug!(
            buckets = num_buckets,
            capacity = num_buckets * self.bucket_max_size,
            dim = self.dim,
            device_bytes = usage.device_bytes,
            host_bytes = usage.host_bytes,
            "table created"
        );

        Ok(Table {
            inner: RwLock::new(Inner {
                generation,
                allocator,
            }),
            hasher: self.hasher,
            counters: AtomicCounters::new(),
            dim: self.dim,
            bucket_max_size: self.bucket_max_size,
            max_size: self.max_size,
            max_load_factor: self.max_load_factor,
            admission: self.admission,
            io_batch_size: self.io_batch_size,
            _values: PhantomData,
        })
    }
}

/// One bucket array with its locks and value pointers.
struct Generation<K, M> {
    buckets: Box<[UnsafeCell<Bucket<K, M>>]>,
    values: Box<[NonNull<u8>]>,
    locks: BucketLockTable,
    size: AtomicUsize,
    mask: usize,
}

// SAFETY: a bucket and its value array are only accessed while the bucket's
// lock is held, or while the resize barrier is held exclusively.
unsafe impl<K: Send, M: Send> Send for Generation<K, M> {}
unsafe impl<K: Send, M: Send> Sync for Generation<K, M> {}

impl<K: Key, M: Meta> Generation<K, M> {
    fn new(num_buckets: usize, bucket_max_size: usize, allocator: &TierAllocator) -> Self {
        debug_assert!(num_buckets.is_power_of_two());
        debug_assert!(allocator.num_buckets() >= num_buckets);
        Self {
            buckets: (0..num_buckets)
                .map(|_| UnsafeCell::new(Bucket::new(bucket_max_size)))
                .collect(),
            values: (0..num_buckets).map(|i| allocator.bucket_ptr(i)).collect(),
            locks: BucketLockTable::new(num_buckets),
            size: AtomicUsize::new(0),
            mask: num_buckets - 1,
        }
    }

    #[inline]
    fn num_buckets(&self) -> usize {
        self.buckets.len()
    }

    /// Access bucket `index` and its values without locking.
    ///
    /// # Safety
    ///
    /// The caller must hold the bucket's lock, or otherwise guarantee no
    /// other reference to this bucket exists.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    unsafe fn bucket_mut<V: Value>(
        &self,
        index: usize,
        dim: usize,
    ) -> (&mut Bucket<K, M>, &mut [V]) {
        let bucket = unsafe { &mut *self.buckets[index].get() };
        let len = bucket.capacity() * dim;
        let values =
            unsafe { std::slice::from_raw_parts_mut(self.values[index].as_ptr() as *mut V, len) };
        (bucket, values)
    }

    /// Run `f` on bucket `index` under its lock.
    #[inline]
    fn with_bucket<V: Value, R>(
        &self,
        index: usize,
        dim: usize,
        f: impl FnOnce(&mut Bucket<K, M>, &mut [V]) -> R,
    ) -> R {
        let _guard = self.locks.lock(index);
        // SAFETY: the guard holds the bucket's lock.
        let (bucket, values) = unsafe { self.bucket_mut(index, dim) };
        f(bucket, values)
    }

    /// Copy out the occupied slots of a bucket range that satisfy `keep`.
    fn export<V: Value>(
        &self,
        range: std::ops::Range<usize>,
        dim: usize,
        keep: impl Fn(&K, &M) -> bool + Sync,
    ) -> Entries<K, V, M> {
        range
            .into_par_iter()
            .map(|index| {
                self.with_bucket(index, dim, |bucket: &mut Bucket<K, M>, values: &mut [V]| {
                    let mut out = Entries::new();
                    for (slot, key, meta) in bucket.occupied() {
                        if keep(&key, &meta) {
                            out.keys.push(key);
                            out.metas.push(meta);
                            out.values.extend_from_slice(&values[slot * dim..(slot + 1) * dim]);
                        }
                    }
                    out
                })
            })
            .reduce(Entries::new, |mut a, b| {
                a.append(b);
                a
            })
    }
}

struct Inner<K, M> {
    generation: Generation<K, M>,
    allocator: TierAllocator,
}

/// Concurrent, capacity-bounded table of fixed-width vectors.
///
/// `K` is the key type, `V` the vector element type, `M` the meta type and
/// `H` the key hasher. Batch operations run on the rayon thread pool; the
/// table may also be shared between caller threads through `Arc`.
pub struct Table<K, V, M = u64, H = DefaultKeyHasher> {
    inner: RwLock<Inner<K, M>>,
    hasher: H,
    counters: AtomicCounters,
    dim: usize,
    bucket_max_size: usize,
    max_size: usize,
    max_load_factor: f64,
    admission: Admission,
    io_batch_size: usize,
    _values: PhantomData<fn() -> V>,
}

impl<K: Key, V: Value, M: Meta> Table<K, V, M, DefaultKeyHasher> {
    /// Create a builder with default settings.
    pub fn builder() -> TableBuilder<K, V, M, DefaultKeyHasher> {
        TableBuilder::new()
    }
}

impl<K: Key, V: Value, M: Meta, H: KeyHasher<K>> Table<K, V, M, H> {
    /// Bucket index and probe start slot for a key.
    #[inline]
    fn locate(&self, key: &K, mask: usize) -> (usize, usize) {
        let hash = self.hasher.hash(key);
        let bucket = (hash as usize) & mask;
        let start = ((hash >> 32) as usize) % self.bucket_max_size;
        (bucket, start)
    }

    fn check_values(&self, keys: usize, values: usize) -> TableResult<()> {
        if values % self.dim != 0 {
            return Err(TableError::DimensionMismatch {
                expected: self.dim,
                actual: if keys > 0 { values / keys } else { values },
            });
        }
        if values / self.dim != keys {
            return Err(TableError::CountMismatch {
                keys,
                values: values / self.dim,
            });
        }
        Ok(())
    }

    fn check_metas(keys: usize, metas: Option<&[M]>) -> TableResult<()> {
        match metas {
            Some(metas) if metas.len() != keys => Err(TableError::MetaCountMismatch {
                keys,
                metas: metas.len(),
            }),
            _ => Ok(()),
        }
    }

    /// Look up a batch of keys.
    pub fn find(&self, keys: &[K]) -> FindResult<V, M> {
        let dim = self.dim;
        let mut result = FindResult::with_len(keys.len(), dim);
        let inner = self.inner.read();
        let generation = &inner.generation;

        result
            .values
            .par_chunks_mut(dim)
            .zip(result.metas.par_iter_mut())
            .zip(result.found.par_iter_mut())
            .zip(keys.par_iter())
            .for_each(|(((out, meta_out), found_out), key)| {
                let (index, start) = self.locate(key, generation.mask);
                let hit = generation.with_bucket(index, dim, |bucket, values: &mut [V]| {
                    match bucket.find(*key, start) {
                        Some(slot) => {
                            out.copy_from_slice(&values[slot * dim..(slot + 1) * dim]);
                            *meta_out = bucket.metas()[slot];
                            true
                        }
                        None => false,
                    }
                });
                *found_out = hit;
                self.counters.record_find(hit);
            });

        result
    }

    /// Check which keys are present.
    pub fn contains(&self, keys: &[K]) -> Vec<bool> {
        let inner = self.inner.read();
        let generation = &inner.generation;
        keys.par_iter()
            .map(|key| {
                let (index, start) = self.locate(key, generation.mask);
                generation.with_bucket(index, self.dim, |bucket, _: &mut [V]| {
                    bucket.find(*key, start).is_some()
                })
            })
            .collect()
    }

    /// Insert keys or overwrite existing ones.
    ///
    /// `values` holds `dim` elements per key. Without `metas` every stored
    /// key gets its bucket's next recency counter. Full buckets evict their
    /// minimum-meta entry; a supplied meta that loses against the bucket
    /// minimum is reported as [`InsertStatus::Rejected`].
    pub fn insert_or_assign(
        &self,
        keys: &[K],
        values: &[V],
        metas: Option<&[M]>,
    ) -> TableResult<Vec<InsertStatus>> {
        self.check_values(keys.len(), values.len())?;
        Self::check_metas(keys.len(), metas)?;
        self.grow_if_needed()?;

        let dim = self.dim;
        let inner = self.inner.read();
        let generation = &inner.generation;

        let statuses = keys
            .par_iter()
            .zip(values.par_chunks(dim))
            .enumerate()
            .map(|(i, (key, value))| {
                let meta = metas.map(|m| m[i]);
                let (index, start) = self.locate(key, generation.mask);
                let (status, _) = generation.with_bucket(index, dim, |bucket, slots: &mut [V]| {
                    bucket.insert_or_assign(
                        *key,
                        start,
                        value,
                        meta,
                        self.admission,
                        slots,
                        dim,
                        None,
                    )
                });
                self.record_insert(generation, status);
                status
            })
            .collect();

        Ok(statuses)
    }

    /// Insert keys like [`insert_or_assign`](Self::insert_or_assign) and
    /// return the entries that were evicted to make room.
    pub fn insert_and_evict(
        &self,
        keys: &[K],
        values: &[V],
        metas: Option<&[M]>,
    ) -> TableResult<(Vec<InsertStatus>, Entries<K, V, M>)> {
        self.check_values(keys.len(), values.len())?;
        Self::check_metas(keys.len(), metas)?;
        self.grow_if_needed()?;

        let dim = self.dim;
        let inner = self.inner.read();
        let generation = &inner.generation;

        let mut evicted_values = vec![V::default(); keys.len() * dim];
        let outcomes: Vec<_> = keys
            .par_iter()
            .zip(values.par_chunks(dim))
            .zip(evicted_values.par_chunks_mut(dim))
            .enumerate()
            .map(|(i, ((key, value), evicted_out))| {
                let meta = metas.map(|m| m[i]);
                let (index, start) = self.locate(key, generation.mask);
                let (status, victim) =
                    generation.with_bucket(index, dim, |bucket, slots: &mut [V]| {
                        bucket.insert_or_assign(
                            *key,
                            start,
                            value,
                            meta,
                            self.admission,
                            slots,
                            dim,
                            Some(evicted_out),
                        )
                    });
                self.record_insert(generation, status);
                (status, victim)
            })
            .collect();

        let mut evicted = Entries::new();
        let mut statuses = Vec::with_capacity(outcomes.len());
        for (i, (status, victim)) in outcomes.into_iter().enumerate() {
            if let Some(victim) = victim {
                evicted.keys.push(victim.key);
                evicted.metas.push(victim.meta);
                evicted
                    .values
                    .extend_from_slice(&evicted_values[i * dim..(i + 1) * dim]);
            }
            statuses.push(status);
        }

        Ok((statuses, evicted))
    }

    /// Overwrite the values of keys that are present. Missing keys are skipped.
    pub fn assign(&self, keys: &[K], values: &[V], metas: Option<&[M]>) -> TableResult<Vec<bool>> {
        self.check_values(keys.len(), values.len())?;
        Self::check_metas(keys.len(), metas)?;

        let dim = self.dim;
        let inner = self.inner.read();
        let generation = &inner.generation;

        let assigned = keys
            .par_iter()
            .zip(values.par_chunks(dim))
            .enumerate()
            .map(|(i, (key, value))| {
                let meta = metas.map(|m| m[i]);
                let (index, start) = self.locate(key, generation.mask);
                let hit = generation.with_bucket(index, dim, |bucket, slots: &mut [V]| {
                    bucket.assign(*key, start, value, meta, slots, dim)
                });
                if hit {
                    self.counters.record_insert(InsertStatus::Updated);
                }
                hit
            })
            .collect();

        Ok(assigned)
    }

    /// Return the values of present keys and insert the rest with `default_values`.
    ///
    /// `found[i]` reports whether the key was already present. For inserted
    /// keys the result holds the default vector and the stored meta; keys
    /// refused by the admission rule are reported with `M::MAX`.
    pub fn find_or_insert(
        &self,
        keys: &[K],
        default_values: &[V],
        metas: Option<&[M]>,
    ) -> TableResult<FindResult<V, M>> {
        self.check_values(keys.len(), default_values.len())?;
        Self::check_metas(keys.len(), metas)?;
        self.grow_if_needed()?;

        let dim = self.dim;
        let mut result = FindResult::with_len(keys.len(), dim);
        let inner = self.inner.read();
        let generation = &inner.generation;

        result
            .values
            .par_chunks_mut(dim)
            .zip(result.metas.par_iter_mut())
            .zip(result.found.par_iter_mut())
            .zip(keys.par_iter().zip(default_values.par_chunks(dim)))
            .enumerate()
            .for_each(|(i, (((out, meta_out), found_out), (key, default)))| {
                let meta = metas.map(|m| m[i]);
                let (index, start) = self.locate(key, generation.mask);
                let inserted = generation.with_bucket(index, dim, |bucket, slots: &mut [V]| {
                    if let Some(slot) = bucket.find(*key, start) {
                        out.copy_from_slice(&slots[slot * dim..(slot + 1) * dim]);
                        *meta_out = bucket.metas()[slot];
                        *found_out = true;
                        return None;
                    }

                    out.copy_from_slice(default);
                    let (status, _) = bucket.insert_or_assign(
                        *key,
                        start,
                        default,
                        meta,
                        self.admission,
                        slots,
                        dim,
                        None,
                    );
                    if status.is_stored()
                        && let Some(slot) = bucket.find(*key, start)
                    {
                        *meta_out = bucket.metas()[slot];
                    }
                    Some(status)
                });

                self.counters.record_find(inserted.is_none());
                if let Some(status) = inserted {
                    self.record_insert(generation, status);
                }
            });

        Ok(result)
    }

    /// Erase a batch of keys.
    pub fn erase(&self, keys: &[K]) -> Vec<EraseStatus> {
        let inner = self.inner.read();
        let generation = &inner.generation;

        let statuses: Vec<EraseStatus> = keys
            .par_iter()
            .map(|key| {
                let (index, start) = self.locate(key, generation.mask);
                let removed = generation.with_bucket(index, self.dim, |bucket, _: &mut [V]| {
                    bucket.erase(*key, start)
                });
                if removed {
                    generation.size.fetch_sub(1, Ordering::Relaxed);
                    EraseStatus::Removed
                } else {
                    EraseStatus::NotFound
                }
            })
            .collect();

        let removed = statuses
            .iter()
            .filter(|s| **s == EraseStatus::Removed)
            .count();
        self.counters.record_erase(removed as u64);
        statuses
    }

    /// Erase every entry for which `pred(key, meta, pattern, threshold)` holds.
    ///
    /// Returns the number of entries removed.
    pub fn erase_if<F>(&self, pred: F, pattern: K, threshold: M) -> usize
    where
        F: Fn(&K, &M, &K, &M) -> bool + Sync,
    {
        let inner = self.inner.read();
        let generation = &inner.generation;

        let removed: usize = (0..generation.num_buckets())
            .into_par_iter()
            .map(|index| {
                generation.with_bucket(index, self.dim, |bucket, _: &mut [V]| {
                    bucket.erase_if(&pred, &pattern, &threshold)
                })
            })
            .sum();

        generation.size.fetch_sub(removed, Ordering::Relaxed);
        self.counters.record_erase(removed as u64);
        removed
    }

    /// Remove every entry and reset the recency counters. Capacity is kept.
    pub fn clear(&self) {
        let inner = self.inner.write();
        let generation = &inner.generation;
        for index in 0..generation.num_buckets() {
            generation.with_bucket(index, self.dim, |bucket, _: &mut [V]| bucket.clear());
        }
        generation.size.store(0, Ordering::Relaxed);
        debug!("table cleared");
    }

    /// Copy out the entries of buckets `[offset, offset + n_buckets)`.
    ///
    /// The range is clamped to the current bucket count.
    pub fn export_batch(&self, offset: usize, n_buckets: usize) -> Entries<K, V, M> {
        let inner = self.inner.read();
        let generation = &inner.generation;
        let range = clamp_range(offset, n_buckets, generation.num_buckets());
        generation.export(range, self.dim, |_, _| true)
    }

    /// Copy out the entries of a bucket range that satisfy
    /// `pred(key, meta, pattern, threshold)`.
    pub fn export_batch_if<F>(
        &self,
        pred: F,
        pattern: K,
        threshold: M,
        offset: usize,
        n_buckets: usize,
    ) -> Entries<K, V, M>
    where
        F: Fn(&K, &M, &K, &M) -> bool + Sync,
    {
        let inner = self.inner.read();
        let generation = &inner.generation;
        let range = clamp_range(offset, n_buckets, generation.num_buckets());
        generation.export(range, self.dim, |k, m| pred(k, m, &pattern, &threshold))
    }

    /// Number of stored entries.
    pub fn size(&self) -> usize {
        self.inner.read().generation.size.load(Ordering::Relaxed)
    }

    /// Whether the table holds no entries.
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.bucket_count() * self.bucket_max_size
    }

    /// Number of buckets.
    pub fn bucket_count(&self) -> usize {
        self.inner.read().generation.num_buckets()
    }

    /// Slots per bucket.
    pub fn bucket_max_size(&self) -> usize {
        self.bucket_max_size
    }

    /// Capacity limit.
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Elements per value vector.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Occupancy as a fraction of capacity.
    pub fn load_factor(&self) -> f64 {
        let inner = self.inner.read();
        let generation = &inner.generation;
        generation.size.load(Ordering::Relaxed) as f64
            / (generation.num_buckets() * self.bucket_max_size) as f64
    }

    /// Device budget not yet allocated.
    pub fn remaining_hbm_for_vectors(&self) -> usize {
        self.inner.read().allocator.remaining_hbm()
    }

    /// Value memory per tier.
    pub fn tier_usage(&self) -> TierUsage {
        self.inner.read().allocator.usage()
    }

    /// Operation counters plus occupancy and memory.
    pub fn metrics(&self) -> TableMetrics {
        let inner = self.inner.read();
        let buckets = inner.generation.num_buckets();
        TableMetrics {
            counters: self.counters.snapshot(),
            size: inner.generation.size.load(Ordering::Relaxed),
            capacity: buckets * self.bucket_max_size,
            buckets,
            tiers: inner.allocator.usage(),
            remaining_hbm: inner.allocator.remaining_hbm(),
        }
    }

    /// Bucket a key currently maps to.
    pub fn bucket_of(&self, key: &K) -> usize {
        let inner = self.inner.read();
        self.locate(key, inner.generation.mask).0
    }

    /// Run `f` on a bucket while holding its lock.
    pub fn inspect_bucket<R>(&self, index: usize, f: impl FnOnce(&Bucket<K, M>) -> R) -> R {
        let inner = self.inner.read();
        inner
            .generation
            .with_bucket(index, self.dim, |bucket, _: &mut [V]| f(bucket))
    }

    fn record_insert(&self, generation: &Generation<K, M>, status: InsertStatus) {
        if status == InsertStatus::Inserted {
            generation.size.fetch_add(1, Ordering::Relaxed);
        }
        self.counters.record_insert(status);
    }

    /// Double the table before an insertion if it is over its load factor.
    fn grow_if_needed(&self) -> TableResult<()> {
        let capacity = self.capacity();
        if self.load_factor() <= self.max_load_factor {
            return Ok(());
        }
        match capacity.checked_mul(2) {
            Some(doubled) if doubled <= self.max_size => self.reserve(doubled),
            _ => Ok(()),
        }
    }

    /// Grow the table to hold at least `new_capacity` entries.
    ///
    /// Capacity doubles until it reaches `new_capacity` or another doubling
    /// would pass `max_size`. Smaller requests are a no-op.
    pub fn reserve(&self, new_capacity: usize) -> TableResult<()> {
        if new_capacity > self.max_size {
            return Err(TableError::CapacityExceeded {
                requested: new_capacity,
                max_size: self.max_size,
            });
        }

        let mut inner = self.inner.write();
        let old_buckets = inner.generation.num_buckets();
        let new_buckets = self.target_buckets(old_buckets, new_capacity)?;
        if new_buckets == old_buckets {
            return Ok(());
        }
        if new_buckets.checked_mul(inner.allocator.bucket_bytes()).is_none() {
            return Err(TableError::CapacityExceeded {
                requested: new_capacity,
                max_size: self.max_size,
            });
        }

        self.rehash(&mut inner, new_buckets)
    }

    /// Bucket count after doubling `buckets` towards `new_capacity`.
    ///
    /// Stops early when the next doubling would pass `max_size`. A request
    /// whose bucket count or capacity cannot be represented is refused.
    fn target_buckets(&self, buckets: usize, new_capacity: usize) -> TableResult<usize> {
        let exceeded = TableError::CapacityExceeded {
            requested: new_capacity,
            max_size: self.max_size,
        };
        let capacity_of = |n: usize| n.checked_mul(self.bucket_max_size);

        let mut buckets = buckets;
        loop {
            match capacity_of(buckets) {
                Some(capacity) if capacity >= new_capacity => return Ok(buckets),
                Some(_) => {}
                None => return Err(exceeded),
            }
            let Some(doubled) = buckets.checked_mul(2) else {
                return Err(exceeded);
            };
            match capacity_of(doubled) {
                Some(capacity) if capacity <= self.max_size => buckets = doubled,
                Some(_) => return Ok(buckets),
                None => return Err(exceeded),
            }
        }
    }

    /// Build a generation of `new_buckets` buckets and migrate every entry.
    ///
    /// Storage is allocated before any entry moves, so a failure leaves the
    /// current generation untouched.
    fn rehash(&self, inner: &mut Inner<K, M>, new_buckets: usize) -> TableResult<()> {
        let dim = self.dim;
        let old = &inner.generation;
        let old_buckets = old.num_buckets();
        debug_assert!(new_buckets > old_buckets && new_buckets % old_buckets == 0);

        if let Err(e) = inner.allocator.grow_to(new_buckets) {
            warn!(error = %e, old_buckets, new_buckets, "resize failed, keeping current capacity");
            return Err(e);
        }

        let new = Generation::new(new_buckets, self.bucket_max_size, &inner.allocator);
        let mask = new.mask;

        // Bucket i keeps its value array; entries leaving it can only land in
        // buckets i + k * old_buckets, all of which start empty.
        (0..old_buckets).into_par_iter().for_each(|i| {
            // SAFETY: the barrier is held exclusively and each task touches
            // only buckets congruent to i modulo old_buckets.
            let (source, _) = unsafe { old.bucket_mut::<V>(i, dim) };
            let (stay, stay_values) = unsafe { new.bucket_mut::<V>(i, dim) };
            stay.clone_from_bucket(source);

            let moving: Vec<_> = stay
                .occupied()
                .filter_map(|(slot, key, meta)| {
                    let (index, start) = self.locate(&key, mask);
                    (index != i).then_some((slot, key, meta, index, start))
                })
                .collect();

            for (slot, key, meta, index, start) in moving {
                let (target, target_values) = unsafe { new.bucket_mut::<V>(index, dim) };
                target.bump_counter(source.cur_meta());
                match target.place(key, meta, start) {
                    Some(dest) => {
                        target_values[dest * dim..(dest + 1) * dim]
                            .copy_from_slice(&stay_values[slot * dim..(slot + 1) * dim]);
                    }
                    None => debug_assert!(false, "migration target bucket overflowed"),
                }
                stay.clear_slot(slot);
            }
        });

        new.size
            .store(old.size.load(Ordering::Relaxed), Ordering::Relaxed);
        inner.generation = new;
        self.counters.record_resize();

        let usage = inner.allocator.usage();
        info!(
            old_capacity = old_buckets * self.bucket_max_size,
            new_capacity = new_buckets * self.bucket_max_size,
            size = inner.generation.size.load(Ordering::Relaxed),
            device_bytes = usage.device_bytes,
            host_bytes = usage.host_bytes,
            "table resized"
        );
        Ok(())
    }

    /// Stream every entry to `file`.
    ///
    /// Entries are exported `io_batch_size` at a time, bucket range by bucket
    /// range. Returns the number of entries written.
    pub fn save<F: KvFile<K, V, M> + ?Sized>(&self, file: &mut F) -> TableResult<usize> {
        let dim = self.dim;
        let inner = self.inner.read();
        let generation = &inner.generation;
        let buckets_per_chunk = (self.io_batch_size / self.bucket_max_size).max(1);

        let mut written = 0;
        let mut offset = 0;
        while offset < generation.num_buckets() {
            let range = clamp_range(offset, buckets_per_chunk, generation.num_buckets());
            offset = range.end;

            let chunk: Entries<K, V, M> = generation.export(range, dim, |_, _| true);
            write_chunk(file, &chunk, dim, &mut written)?;
        }

        debug!(entries = written, "table saved");
        Ok(written)
    }

    /// Insert every entry read from `file`, keeping the stored metas.
    ///
    /// Returns the number of entries read.
    pub fn load<F: KvFile<K, V, M> + ?Sized>(&self, file: &mut F) -> TableResult<usize> {
        let dim = self.dim;
        let batch = self.io_batch_size;
        let mut keys = vec![K::EMPTY; batch];
        let mut values = vec![V::default(); batch * dim];
        let mut metas = vec![M::MAX; batch];

        let mut total = 0;
        loop {
            let n = file.read(batch, &mut keys, &mut values, &mut metas)?.min(batch);
            if n == 0 {
                break;
            }
            self.insert_or_assign(&keys[..n], &values[..n * dim], Some(&metas[..n]))?;
            total += n;
        }

        debug!(entries = total, "table loaded");
        Ok(total)
    }
}

fn clamp_range(offset: usize, len: usize, end: usize) -> std::ops::Range<usize> {
    let start = offset.min(end);
    start..start.saturating_add(len).min(end)
}

/// Write a whole chunk, retrying on short writes.
fn write_chunk<K, V, M, F>(
    file: &mut F,
    chunk: &Entries<K, V, M>,
    dim: usize,
    written: &mut usize,
) -> TableResult<()>
where
    F: KvFile<K, V, M> + ?Sized,
{
    let mut done = 0;
    let mut stalled = 0;
    while done < chunk.len() {
        let n = chunk.len() - done;
        let accepted = file
            .write(
                n,
                &chunk.keys[done..],
                &chunk.values[done * dim..],
                &chunk.metas[done..],
            )?
            .min(n);

        if accepted == 0 {
            stalled += 1;
            if stalled >= MAX_STALLED_WRITES {
                return Err(TableError::PersistenceStalled { written: *written });
            }
            continue;
        }

        stalled = 0;
        done += accepted;
        *written += accepted;
    }
    Ok(())
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use crate::persistence::MemoryKvFile;

    fn single_bucket(slots: usize) -> Table<u64, f32, i64> {
        Table::builder()
            .init_capacity(slots)
            .max_size(slots)
            .bucket_max_size(slots)
            .dim(2)
            .build()
            .unwrap()
    }

    fn vector(key: u64) -> [f32; 2] {
        [key as f32, -(key as f32)]
    }

    fn vectors(keys: &[u64]) -> Vec<f32> {
        keys.iter().flat_map(|k| vector(*k)).collect()
    }

    #[test]
    fn test_builder_defaults() {
        let table: Table<u64, f32> = Table::builder().build().unwrap();
        assert_eq!(table.dim(), 64);
        assert_eq!(table.bucket_max_size(), 128);
        assert_eq!(table.capacity(), 64 * 1024);
        assert_eq!(table.bucket_count(), 512);
        assert_eq!(table.max_size(), usize::MAX);
        assert_eq!(table.remaining_hbm_for_vectors(), 0);
        assert!(table.is_empty());
    }

    #[test]
    fn test_builder_validation() {
        let err = Table::<u64, f32>::builder().dim(0).build().err().unwrap();
        assert!(matches!(err, TableError::InvalidConfig(_)));
        let err = Table::<u64, f32>::builder()
            .bucket_max_size(0)
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, TableError::InvalidConfig(_)));
        let err = Table::<u64, f32>::builder()
            .max_load_factor(1.5)
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, TableError::InvalidConfig(_)));
        let err = Table::<u64, f32>::builder()
            .init_capacity(1024)
            .max_size(512)
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, TableError::InvalidConfig(_)));
    }

    #[test]
    fn test_capacity_rounds_to_power_of_two_buckets() {
        let table: Table<u64, f32> = Table::builder()
            .init_capacity(1000)
            .bucket_max_size(16)
            .dim(4)
            .build()
            .unwrap();
        assert_eq!(table.bucket_count(), 64);
        assert_eq!(table.capacity(), 1024);
    }

    #[test]
    fn test_find_after_insert() {
        let table: Table<u64, f32> = Table::builder()
            .init_capacity(1024)
            .bucket_max_size(16)
            .dim(2)
            .build()
            .unwrap();

        let keys: Vec<u64> = (0..100).collect();
        let statuses = table.insert_or_assign(&keys, &vectors(&keys), None).unwrap();
        assert!(statuses.iter().all(|s| *s == InsertStatus::Inserted));
        assert_eq!(table.size(), 100);

        let result = table.find(&keys);
        assert_eq!(result.hits(), 100);
        for (i, key) in keys.iter().enumerate() {
            assert_eq!(result.value(i), Some(&vector(*key)[..]));
        }

        let missing = table.find(&[1000, 1001]);
        assert_eq!(missing.found, vec![false, false]);
        assert_eq!(missing.metas, vec![u64::MAX, u64::MAX]);
        assert_eq!(missing.value(0), None);
    }

    #[test]
    fn test_eviction_scenario() {
        let table = single_bucket(4);
        let keys = [1, 2, 3, 4];
        // One key per batch so auto-assigned metas follow key order.
        for key in keys {
            table.insert_or_assign(&[key], &vector(key), None).unwrap();
        }
        assert_eq!(table.size(), 4);
        let metas = table.find(&keys).metas;
        assert_eq!(metas, vec![0, 1, 2, 3]);

        let statuses = table.insert_or_assign(&[5], &vector(5), None).unwrap();
        assert_eq!(statuses, vec![InsertStatus::Evicted]);
        let result = table.find(&[1, 2, 3, 4, 5]);
        assert_eq!(result.found, vec![false, true, true, true, true]);
        assert_eq!(result.metas[4], 4);
        assert_eq!(table.size(), 4);

        let statuses = table.insert_or_assign(&[6], &vector(6), Some(&[-1])).unwrap();
        assert_eq!(statuses, vec![InsertStatus::Rejected]);
        assert!(!table.contains(&[6])[0]);
        assert_eq!(table.find(&[2, 3, 4, 5]).hits(), 4);

        table.inspect_bucket(0, |bucket| {
            assert!(bucket.min_cache_is_exact());
            assert_eq!(bucket.min_meta(), 1);
        });
    }

    #[test]
    fn test_insert_and_evict_returns_victims() {
        let table = single_bucket(2);
        table.insert_or_assign(&[10], &vector(10), Some(&[5])).unwrap();
        table.insert_or_assign(&[11], &vector(11), Some(&[7])).unwrap();

        let (statuses, evicted) = table
            .insert_and_evict(&[12], &vector(12), Some(&[6]))
            .unwrap();
        assert_eq!(statuses, vec![InsertStatus::Evicted]);
        assert_eq!(evicted.keys, vec![10]);
        assert_eq!(evicted.metas, vec![5]);
        assert_eq!(evicted.values, vector(10).to_vec());

        let (statuses, evicted) = table
            .insert_and_evict(&[13], &vector(13), Some(&[1]))
            .unwrap();
        assert_eq!(statuses, vec![InsertStatus::Rejected]);
        assert!(evicted.is_empty());
    }

    #[test]
    fn test_strict_admission() {
        let table: Table<u64, f32, i64> = Table::builder()
            .init_capacity(1)
            .max_size(1)
            .bucket_max_size(1)
            .dim(2)
            .admission(Admission::StrictlyLarger)
            .build()
            .unwrap();
        table.insert_or_assign(&[1], &vector(1), Some(&[3])).unwrap();
        let statuses = table.insert_or_assign(&[2], &vector(2), Some(&[3])).unwrap();
        assert_eq!(statuses, vec![InsertStatus::Rejected]);
        let statuses = table.insert_or_assign(&[2], &vector(2), Some(&[4])).unwrap();
        assert_eq!(statuses, vec![InsertStatus::Evicted]);
    }

    #[test]
    fn test_update_existing() {
        let table = single_bucket(4);
        table.insert_or_assign(&[1], &vector(1), Some(&[10])).unwrap();
        let statuses = table.insert_or_assign(&[1], &[9.0, 9.0], Some(&[20])).unwrap();
        assert_eq!(statuses, vec![InsertStatus::Updated]);
        assert_eq!(table.size(), 1);
        let result = table.find(&[1]);
        assert_eq!(result.value(0), Some(&[9.0f32, 9.0][..]));
        assert_eq!(result.metas[0], 20);
    }

    #[test]
    fn test_argument_validation() {
        let table = single_bucket(4);
        let err = table.insert_or_assign(&[1, 2], &[1.0, 2.0], None).unwrap_err();
        assert!(matches!(err, TableError::CountMismatch { keys: 2, values: 1 }));
        let err = table.insert_or_assign(&[1], &[1.0, 2.0, 3.0], None).unwrap_err();
        assert!(matches!(
            err,
            TableError::DimensionMismatch {
                expected: 2,
                actual: 3
            }
        ));
        let err = table
            .insert_or_assign(&[1], &[1.0, 2.0], Some(&[1, 2]))
            .unwrap_err();
        assert!(matches!(err, TableError::MetaCountMismatch { keys: 1, metas: 2 }));
        assert!(table.is_empty());
    }

    #[test]
    fn test_empty_batch() {
        let table = single_bucket(4);
        assert!(table.insert_or_assign(&[], &[], None).unwrap().is_empty());
        assert!(table.find(&[]).is_empty());
        assert!(table.erase(&[]).is_empty());
    }

    #[test]
    fn test_erase_then_find() {
        let table = single_bucket(4);
        table.insert_or_assign(&[1, 2], &vectors(&[1, 2]), None).unwrap();
        assert_eq!(
            table.erase(&[1, 7]),
            vec![EraseStatus::Removed, EraseStatus::NotFound]
        );
        assert_eq!(table.size(), 1);
        assert_eq!(table.find(&[1, 2]).found, vec![false, true]);
        table.inspect_bucket(0, |bucket| assert!(bucket.min_cache_is_exact()));
    }

    #[test]
    fn test_erase_if() {
        let table: Table<u64, f32, u64> = Table::builder()
            .init_capacity(256)
            .bucket_max_size(16)
            .dim(2)
            .build()
            .unwrap();
        let keys: Vec<u64> = (0..64).collect();
        table
            .insert_or_assign(&keys, &vectors(&keys), Some(&keys))
            .unwrap();

        let removed = table.erase_if(|_, meta, _, threshold| meta < threshold, 0, 40);
        assert_eq!(removed, 40);
        assert_eq!(table.size(), 24);
        assert!(table.find(&[39]).found.iter().all(|f| !f));
        assert_eq!(table.find(&[40]).hits(), 1);

        let removed = table.erase_if(|key, _, pattern, _| key % pattern == 0, 2, 0);
        assert_eq!(removed, 12);
        assert_eq!(table.size(), 12);
    }

    #[test]
    fn test_assign_and_contains() {
        let table = single_bucket(4);
        table.insert_or_assign(&[1], &vector(1), None).unwrap();
        let assigned = table
            .assign(&[1, 2], &[5.0, 5.0, 6.0, 6.0], None)
            .unwrap();
        assert_eq!(assigned, vec![true, false]);
        assert_eq!(table.contains(&[1, 2]), vec![true, false]);
        assert_eq!(table.find(&[1]).value(0), Some(&[5.0f32, 5.0][..]));
    }

    #[test]
    fn test_find_or_insert() {
        let table = single_bucket(4);
        table.insert_or_assign(&[1], &vector(1), Some(&[9])).unwrap();

        let result = table
            .find_or_insert(&[1, 2], &[0.0, 0.0, 7.0, 7.0], Some(&[0, 3]))
            .unwrap();
        assert_eq!(result.found, vec![true, false]);
        assert_eq!(&result.values[..2], &vector(1));
        assert_eq!(&result.values[2..], &[7.0, 7.0]);
        assert_eq!(result.metas, vec![9, 3]);
        assert_eq!(table.size(), 2);
        assert_eq!(table.find(&[2]).value(0), Some(&[7.0f32, 7.0][..]));
    }

    #[test]
    fn test_clear() {
        let table = single_bucket(4);
        table.insert_or_assign(&[1, 2, 3], &vectors(&[1, 2, 3]), None).unwrap();
        table.clear();
        assert!(table.is_empty());
        assert_eq!(table.capacity(), 4);
        assert_eq!(table.find(&[1, 2, 3]).hits(), 0);

        table.insert_or_assign(&[4], &vector(4), None).unwrap();
        assert_eq!(table.find(&[4]).metas, vec![0]);
    }

    #[test]
    fn test_reserve() {
        let table: Table<u64, f32> = Table::builder()
            .init_capacity(64)
            .max_size(1024)
            .bucket_max_size(16)
            .dim(2)
            .build()
            .unwrap();
        assert_eq!(table.capacity(), 64);

        table.reserve(32).unwrap();
        assert_eq!(table.capacity(), 64);

        table.reserve(200).unwrap();
        assert_eq!(table.capacity(), 256);

        let err = table.reserve(2048).unwrap_err();
        assert!(matches!(
            err,
            TableError::CapacityExceeded {
                requested: 2048,
                max_size: 1024
            }
        ));
        assert_eq!(table.capacity(), 256);
        assert_eq!(table.metrics().counters.resizes, 1);
    }

    #[test]
    fn test_reserve_unrepresentable_capacity() {
        let table: Table<u64, f32> = Table::builder()
            .init_capacity(1024)
            .bucket_max_size(128)
            .dim(2)
            .build()
            .unwrap();
        let keys: Vec<u64> = (0..100).collect();
        table.insert_or_assign(&keys, &vectors(&keys), None).unwrap();

        let err = table.reserve(usize::MAX).unwrap_err();
        assert!(matches!(
            err,
            TableError::CapacityExceeded {
                requested: usize::MAX,
                ..
            }
        ));
        assert_eq!(table.capacity(), 1024);
        assert_eq!(table.find(&keys).hits(), 100);
        assert_eq!(table.metrics().counters.resizes, 0);

        // Still usable afterwards.
        table.reserve(2048).unwrap();
        assert_eq!(table.capacity(), 2048);
    }

    #[test]
    fn test_build_unrepresentable_capacity() {
        let err = Table::<u64, f32>::builder()
            .init_capacity(usize::MAX)
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, TableError::CapacityExceeded { .. }));
    }

    #[test]
    fn test_resize_preserves_entries_and_metas() {
        let table: Table<u64, f32, u64> = Table::builder()
            .init_capacity(64)
            .bucket_max_size(16)
            .dim(2)
            .build()
            .unwrap();
        let keys: Vec<u64> = (0..40).collect();
        let metas: Vec<u64> = keys.iter().map(|k| 1000 + k).collect();
        table
            .insert_or_assign(&keys, &vectors(&keys), Some(&metas))
            .unwrap();
        let before = table.size();

        table.reserve(1024).unwrap();
        assert_eq!(table.capacity(), 1024);
        assert_eq!(table.size(), before);

        let result = table.find(&keys);
        for (i, key) in keys.iter().enumerate() {
            if result.found[i] {
                assert_eq!(result.value(i), Some(&vector(*key)[..]));
                assert_eq!(result.metas[i], 1000 + key);
            }
        }
        assert_eq!(result.hits(), before);

        for index in 0..table.bucket_count() {
            table.inspect_bucket(index, |bucket| assert!(bucket.min_cache_is_exact()));
        }
    }

    #[test]
    fn test_failed_growth_keeps_entries() {
        // 16 slots * 2 dims * 4 bytes per bucket, 4 buckets per slice.
        let table: Table<u64, f32, u64> = Table::builder()
            .init_capacity(64)
            .bucket_max_size(16)
            .dim(2)
            .max_slice_bytes(512)
            .build()
            .unwrap();
        let keys: Vec<u64> = (0..40).collect();
        let metas: Vec<u64> = keys.iter().map(|k| 1000 + k).collect();
        table
            .insert_or_assign(&keys, &vectors(&keys), Some(&metas))
            .unwrap();
        let size = table.size();
        let usage = table.tier_usage();

        table.inner.write().allocator.fail_after(1);
        let err = table.reserve(1024).unwrap_err();
        assert!(matches!(err, TableError::AllocationFailure { .. }));

        assert_eq!(table.capacity(), 64);
        assert_eq!(table.bucket_count(), 4);
        assert_eq!(table.size(), size);
        assert_eq!(table.tier_usage(), usage);
        assert_eq!(table.metrics().counters.resizes, 0);

        let result = table.find(&keys);
        assert_eq!(result.hits(), size);
        for (i, key) in keys.iter().enumerate() {
            if result.found[i] {
                assert_eq!(result.value(i), Some(&vector(*key)[..]));
                assert_eq!(result.metas[i], 1000 + key);
            }
        }

        table.reserve(1024).unwrap();
        assert_eq!(table.capacity(), 1024);
        assert_eq!(table.find(&keys).hits(), size);
    }

    #[test]
    fn test_auto_resize_on_load_factor() {
        let table: Table<u64, f32> = Table::builder()
            .init_capacity(64)
            .bucket_max_size(16)
            .dim(2)
            .build()
            .unwrap();
        for chunk in (0u64..200).collect::<Vec<_>>().chunks(20) {
            table.insert_or_assign(chunk, &vectors(chunk), None).unwrap();
        }
        assert!(table.capacity() > 64);
        assert!(table.metrics().counters.resizes > 0);
    }

    #[test]
    fn test_auto_resize_respects_max_size() {
        let table: Table<u64, f32> = Table::builder()
            .init_capacity(64)
            .max_size(64)
            .bucket_max_size(16)
            .dim(2)
            .build()
            .unwrap();
        for chunk in (0u64..200).collect::<Vec<_>>().chunks(20) {
            table.insert_or_assign(chunk, &vectors(chunk), None).unwrap();
        }
        assert_eq!(table.capacity(), 64);
        assert!(table.size() <= 64);
    }

    #[test]
    fn test_export_batch() {
        let table: Table<u64, f32, u64> = Table::builder()
            .init_capacity(256)
            .bucket_max_size(16)
            .dim(2)
            .build()
            .unwrap();
        let keys: Vec<u64> = (0..30).collect();
        table.insert_or_assign(&keys, &vectors(&keys), Some(&keys)).unwrap();

        let all = table.export_batch(0, table.bucket_count());
        assert_eq!(all.len(), 30);
        for (i, key) in all.keys.iter().enumerate() {
            assert_eq!(&all.values[i * 2..i * 2 + 2], &vector(*key));
            assert_eq!(all.metas[i], *key);
        }

        let mut split = table.export_batch(0, 2);
        split.append(table.export_batch(2, 100));
        assert_eq!(split.len(), 30);

        assert!(table.export_batch(100, 4).is_empty());

        let odd = table.export_batch_if(|k, _, p, _| k % p == 1, 2, 0, 0, usize::MAX);
        assert_eq!(odd.len(), 15);
    }

    #[test]
    fn test_load_rejects_wider_vectors() {
        let mut file = MemoryKvFile::<u64, f32, u64>::new(4);
        file.write(1, &[5], &[1.0, 2.0, 3.0, 4.0], &[9]).unwrap();

        let table: Table<u64, f32, u64> = Table::builder()
            .init_capacity(64)
            .bucket_max_size(16)
            .dim(2)
            .build()
            .unwrap();
        assert!(matches!(
            table.load(&mut file),
            Err(TableError::Persistence(_))
        ));
        assert_eq!(table.size(), 0);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let table: Table<u64, f32, u64> = Table::builder()
            .init_capacity(1024)
            .bucket_max_size(16)
            .dim(2)
            .io_batch_size(32)
            .build()
            .unwrap();
        let keys: Vec<u64> = (0..100).collect();
        let metas: Vec<u64> = keys.iter().map(|k| k * 3).collect();
        table
            .insert_or_assign(&keys, &vectors(&keys), Some(&metas))
            .unwrap();

        let mut file = MemoryKvFile::new(2).with_max_per_call(7);
        assert_eq!(table.save(&mut file).unwrap(), 100);
        assert_eq!(file.len(), 100);

        let restored: Table<u64, f32, u64> = Table::builder()
            .init_capacity(1024)
            .bucket_max_size(16)
            .dim(2)
            .io_batch_size(32)
            .build()
            .unwrap();
        assert_eq!(restored.load(&mut file).unwrap(), 100);
        assert_eq!(restored.size(), 100);

        let result = restored.find(&keys);
        assert_eq!(result.hits(), 100);
        for (i, key) in keys.iter().enumerate() {
            assert_eq!(result.value(i), Some(&vector(*key)[..]));
            assert_eq!(result.metas[i], key * 3);
        }
    }

    struct StalledFile;

    impl KvFile<u64, f32, i64> for StalledFile {
        fn read(
            &mut self,
            _: usize,
            _: &mut [u64],
            _: &mut [f32],
            _: &mut [i64],
        ) -> std::io::Result<usize> {
            Ok(0)
        }

        fn write(&mut self, _: usize, _: &[u64], _: &[f32], _: &[i64]) -> std::io::Result<usize> {
            Ok(0)
        }
    }

    #[test]
    fn test_save_stalled_sink() {
        let table = single_bucket(4);
        table.insert_or_assign(&[1], &vector(1), None).unwrap();
        let err = table.save(&mut StalledFile).unwrap_err();
        assert!(matches!(err, TableError::PersistenceStalled { written: 0 }));

        assert_eq!(table.load(&mut StalledFile).unwrap(), 0);
    }

    #[test]
    fn test_save_empty_table() {
        let table = single_bucket(4);
        let mut file = MemoryKvFile::new(2);
        assert_eq!(table.save(&mut file).unwrap(), 0);
        assert!(file.is_empty());
    }

    #[test]
    fn test_metrics() {
        let table = single_bucket(2);
        table.insert_or_assign(&[1, 2], &vectors(&[1, 2]), None).unwrap();
        table.insert_or_assign(&[3], &vector(3), None).unwrap();
        table.find(&[1, 2, 3]);
        table.erase(&[3]);

        let m = table.metrics();
        assert_eq!(m.counters.inserts, 2);
        assert_eq!(m.counters.evictions, 1);
        assert_eq!(m.counters.finds, 3);
        assert_eq!(m.counters.hits, 2);
        assert_eq!(m.counters.erases, 1);
        assert_eq!(m.size, 1);
        assert_eq!(m.capacity, 2);
        assert_eq!(m.tiers.host_slices, 1);
        assert_eq!(m.load_factor(), 0.5);
    }

    #[test]
    fn test_custom_hasher() {
        let table: Table<u64, f32, u64, _> = TableBuilder::new()
            .init_capacity(64)
            .bucket_max_size(16)
            .dim(2)
            .hasher(|k: &u64| *k)
            .build()
            .unwrap();
        assert_eq!(table.bucket_of(&5), 1);
        assert_eq!(table.bucket_of(&7), 3);
        table.insert_or_assign(&[5], &vector(5), None).unwrap();
        table.inspect_bucket(1, |bucket| assert_eq!(bucket.len(), 1));
    }
}
