//! Fixed-capacity buckets of key/meta/value slots.
//!
//! A bucket holds `capacity` slots. `keys[i] == K::EMPTY` marks slot `i` as
//! free. Values live outside the bucket in a slice owned by the tier
//! allocator; every mutating method takes that bucket's value array as
//! `&mut [V]` with `dim` elements per slot.
//!
//! Each bucket caches the minimum meta among its occupied slots and one
//! slot holding it. The cache drives eviction, so every mutation that can
//! change the occupied set or a meta keeps it exact:
//!
//! ```text
//! min_meta == min { metas[i] : keys[i] != EMPTY }    (M::MAX when empty)
//! metas[min_pos] == min_meta                         (None when empty)
//! ```
//!
//! All methods assume the caller holds the bucket's lock.

use crate::element::{Key, Meta, Value};
use crate::eviction::{Admission, InsertStatus};

/// An entry displaced by an insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Victim<K, M> {
    /// Key that was evicted.
    pub key: K,
    /// Its meta at eviction time.
    pub meta: M,
}

/// One bucket of the table.
pub struct Bucket<K, M> {
    keys: Box<[K]>,
    metas: Box<[M]>,
    size: usize,
    cur_meta: u64,
    min_meta: M,
    min_pos: Option<usize>,
}

impl<K: Key, M: Meta> Bucket<K, M> {
    /// Create an empty bucket with `capacity` slots.
    pub fn new(capacity: usize) -> Self {
        Self {
            keys: vec![K::EMPTY; capacity].into_boxed_slice(),
            metas: vec![M::MAX; capacity].into_boxed_slice(),
            size: 0,
            cur_meta: 0,
            min_meta: M::MAX,
            min_pos: None,
        }
    }

    /// Number of slots.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.keys.len()
    }

    /// Number of occupied slots.
    #[inline]
    pub fn len(&self) -> usize {
        self.size
    }

    /// Whether no slot is occupied.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Whether every slot is occupied.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.size == self.keys.len()
    }

    /// Slot keys, `K::EMPTY` for free slots.
    #[inline]
    pub fn keys(&self) -> &[K] {
        &self.keys
    }

    /// Slot metas. Free slots hold stale values.
    #[inline]
    pub fn metas(&self) -> &[M] {
        &self.metas
    }

    /// Cached minimum meta among occupied slots.
    #[inline]
    pub fn min_meta(&self) -> M {
        self.min_meta
    }

    /// A slot holding the minimum meta.
    #[inline]
    pub fn min_pos(&self) -> Option<usize> {
        self.min_pos
    }

    /// Next meta the bucket will assign.
    #[inline]
    pub fn cur_meta(&self) -> u64 {
        self.cur_meta
    }

    /// Whether the cached minimum matches the occupied slots.
    pub fn min_cache_is_exact(&self) -> bool {
        let actual = self.occupied().map(|(_, _, m)| m).min().unwrap_or(M::MAX);
        match self.min_pos {
            None => self.size == 0 && self.min_meta == M::MAX,
            Some(pos) => {
                !self.keys[pos].is_empty() && self.metas[pos] == actual && self.min_meta == actual
            }
        }
    }

    /// Iterate over `(slot, key, meta)` of occupied slots.
    pub fn occupied(&self) -> impl Iterator<Item = (usize, K, M)> + '_ {
        self.keys
            .iter()
            .zip(self.metas.iter())
            .enumerate()
            .filter(|(_, (k, _))| !k.is_empty())
            .map(|(i, (k, m))| (i, *k, *m))
    }

    /// Probe order: every slot exactly once starting at `start`.
    #[inline]
    fn probe(&self, start: usize) -> impl Iterator<Item = usize> {
        let capacity = self.keys.len();
        (0..capacity).map(move |i| (start + i) % capacity)
    }

    #[inline]
    fn next_meta(&mut self) -> M {
        let meta = M::from_counter(self.cur_meta);
        self.cur_meta += 1;
        meta
    }

    /// Find the slot holding `key`.
    pub fn find(&self, key: K, start: usize) -> Option<usize> {
        if key.is_empty() {
            return None;
        }
        self.probe(start).find(|&slot| self.keys[slot] == key)
    }

    fn find_free(&self, start: usize) -> Option<usize> {
        if self.is_full() {
            return None;
        }
        self.probe(start).find(|&slot| self.keys[slot].is_empty())
    }

    /// Insert `key` or overwrite its value and meta.
    ///
    /// `meta` defaults to the bucket's recency counter. On a full bucket the
    /// minimum-meta slot is evicted, unless a supplied meta is refused by
    /// `admission`. When a victim is evicted and `evicted_value` is given, the
    /// victim's vector is copied there before being overwritten.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_or_assign<V: Value>(
        &mut self,
        key: K,
        start: usize,
        value: &[V],
        meta: Option<M>,
        admission: Admission,
        values: &mut [V],
        dim: usize,
        evicted_value: Option<&mut [V]>,
    ) -> (InsertStatus, Option<Victim<K, M>>) {
        if key.is_empty() {
            return (InsertStatus::Rejected, None);
        }

        if let Some(slot) = self.find(key, start) {
            let meta = meta.unwrap_or_else(|| self.next_meta());
            self.write_slot(slot, key, meta, value, values, dim);
            self.after_meta_change(slot, meta);
            return (InsertStatus::Updated, None);
        }

        if let Some(slot) = self.find_free(start) {
            let meta = meta.unwrap_or_else(|| self.next_meta());
            self.write_slot(slot, key, meta, value, values, dim);
            self.size += 1;
            if meta < self.min_meta || self.min_pos.is_none() {
                self.min_meta = meta;
                self.min_pos = Some(slot);
            }
            return (InsertStatus::Inserted, None);
        }

        // Full bucket: the minimum-meta slot is the only eviction candidate.
        let Some(victim_slot) = self.min_pos else {
            return (InsertStatus::Rejected, None);
        };

        let meta = match meta {
            Some(meta) if !admission.admits(meta, self.min_meta) => {
                return (InsertStatus::Rejected, None);
            }
            Some(meta) => meta,
            None => self.next_meta(),
        };

        let victim = Victim {
            key: self.keys[victim_slot],
            meta: self.metas[victim_slot],
        };
        if let Some(out) = evicted_value {
            out.copy_from_slice(&values[victim_slot * dim..(victim_slot + 1) * dim]);
        }

        self.write_slot(victim_slot, key, meta, value, values, dim);
        self.recompute_min();

        (InsertStatus::Evicted, Some(victim))
    }

    /// Overwrite the value (and meta) of `key` if present.
    pub fn assign<V: Value>(
        &mut self,
        key: K,
        start: usize,
        value: &[V],
        meta: Option<M>,
        values: &mut [V],
        dim: usize,
    ) -> bool {
        let Some(slot) = self.find(key, start) else {
            return false;
        };
        let meta = meta.unwrap_or_else(|| self.next_meta());
        self.write_slot(slot, key, meta, value, values, dim);
        self.after_meta_change(slot, meta);
        true
    }

    /// Remove `key` if present.
    pub fn erase(&mut self, key: K, start: usize) -> bool {
        match self.find(key, start) {
            Some(slot) => {
                self.clear_slot(slot);
                true
            }
            None => false,
        }
    }

    /// Remove every occupied slot for which `pred(key, meta, pattern, threshold)` holds.
    ///
    /// Returns the number of slots removed.
    pub fn erase_if<F>(&mut self, pred: &F, pattern: &K, threshold: &M) -> usize
    where
        F: Fn(&K, &M, &K, &M) -> bool,
    {
        let mut removed = 0;
        for slot in 0..self.keys.len() {
            let key = self.keys[slot];
            if !key.is_empty() && pred(&key, &self.metas[slot], pattern, threshold) {
                self.keys[slot] = K::EMPTY;
                self.size -= 1;
                removed += 1;
            }
        }
        if removed > 0 {
            self.recompute_min();
        }
        removed
    }

    /// Free every slot and restart the recency counter.
    pub fn clear(&mut self) {
        self.keys.fill(K::EMPTY);
        self.size = 0;
        self.cur_meta = 0;
        self.min_meta = M::MAX;
        self.min_pos = None;
    }

    /// Place an entry in a free slot without drawing a meta.
    ///
    /// Used when migrating entries into a fresh generation. Returns the slot,
    /// or `None` if the bucket is full.
    pub(crate) fn place(&mut self, key: K, meta: M, start: usize) -> Option<usize> {
        let slot = self.find_free(start)?;
        self.keys[slot] = key;
        self.metas[slot] = meta;
        self.size += 1;
        if meta < self.min_meta || self.min_pos.is_none() {
            self.min_meta = meta;
            self.min_pos = Some(slot);
        }
        Some(slot)
    }

    /// Copy the key/meta layout and counter of `other`.
    pub(crate) fn clone_from_bucket(&mut self, other: &Bucket<K, M>) {
        self.keys.copy_from_slice(&other.keys);
        self.metas.copy_from_slice(&other.metas);
        self.size = other.size;
        self.cur_meta = other.cur_meta;
        self.min_meta = other.min_meta;
        self.min_pos = other.min_pos;
    }

    /// Raise the recency counter to at least `floor`.
    pub(crate) fn bump_counter(&mut self, floor: u64) {
        self.cur_meta = self.cur_meta.max(floor);
    }

    /// Free a slot and fix up the minimum cache.
    pub(crate) fn clear_slot(&mut self, slot: usize) {
        debug_assert!(!self.keys[slot].is_empty());
        self.keys[slot] = K::EMPTY;
        self.size -= 1;
        if self.min_pos == Some(slot) {
            self.recompute_min();
        }
    }

    fn write_slot<V: Value>(
        &mut self,
        slot: usize,
        key: K,
        meta: M,
        value: &[V],
        values: &mut [V],
        dim: usize,
    ) {
        self.keys[slot] = key;
        self.metas[slot] = meta;
        values[slot * dim..(slot + 1) * dim].copy_from_slice(value);
    }

    /// Keep the minimum exact after an occupied slot's meta changed.
    fn after_meta_change(&mut self, slot: usize, meta: M) {
        if self.min_pos == Some(slot) {
            if meta <= self.min_meta {
                self.min_meta = meta;
            } else {
                self.recompute_min();
            }
        } else if meta < self.min_meta {
            self.min_meta = meta;
            self.min_pos = Some(slot);
        }
    }

    /// Rescan all occupied slots for the minimum meta.
    pub(crate) fn recompute_min(&mut self) {
        let mut min_meta = M::MAX;
        let mut min_pos = None;
        for (slot, (key, meta)) in self.keys.iter().zip(self.metas.iter()).enumerate() {
            if !key.is_empty() && (min_pos.is_none() || *meta < min_meta) {
                min_meta = *meta;
                min_pos = Some(slot);
            }
        }
        self.min_meta = min_meta;
        self.min_pos = min_pos;
    }
}
