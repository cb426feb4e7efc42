//! Per-bucket exclusive locks.
//!
//! Every bucket owns one spin lock. There is no shared mode: lookups take
//! the same exclusive lock as mutations, because a concurrent eviction can
//! rewrite a slot's key and value bytes.
//!
//! Acquisition never blocks in the OS. A thread spins on the lock word with
//! a test-and-test-and-set loop until it wins the compare-exchange. There is
//! no fairness and no timeout. Callers never hold two bucket locks at once,
//! so lock ordering deadlocks cannot occur.

use crate::sync::{AtomicU32, Ordering, spin_loop};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;

/// A single bucket lock.
struct BucketLock {
    state: AtomicU32,
}

impl BucketLock {
    fn new() -> Self {
        Self {
            state: AtomicU32::new(UNLOCKED),
        }
    }

    #[inline]
    fn try_acquire(&self) -> bool {
        self.state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    #[inline]
    fn acquire(&self) {
        loop {
            if self.try_acquire() {
                return;
            }
            // Spin on a plain load so waiters don't bounce the cache line.
            while self.state.load(Ordering::Relaxed) == LOCKED {
                spin_loop();
            }
        }
    }

    #[inline]
    fn release(&self) {
        let prev = self.state.swap(UNLOCKED, Ordering::Release);
        debug_assert_eq!(prev, LOCKED, "released a bucket lock that was not held");
    }
}

/// One lock per bucket, allocated and replaced together with the bucket array.
pub struct BucketLockTable {
    locks: Box<[BucketLock]>,
}

impl BucketLockTable {
    /// Create `num_buckets` unlocked locks.
    pub fn new(num_buckets: usize) -> Self {
        let locks = (0..num_buckets)
            .map(|_| BucketLock::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { locks }
    }

    /// Number of locks.
    #[inline]
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Whether the table holds no locks.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Spin until the lock for `index` is held by the caller.
    ///
    /// Must be paired with [`release`](Self::release). Prefer
    /// [`lock`](Self::lock) which releases on drop.
    #[inline]
    pub fn acquire(&self, index: usize) {
        self.locks[index].acquire();
    }

    /// Try to take the lock for `index` without spinning.
    #[inline]
    pub fn try_acquire(&self, index: usize) -> bool {
        self.locks[index].try_acquire()
    }

    /// Release the lock for `index`.
    ///
    /// The caller must hold the lock.
    #[inline]
    pub fn release(&self, index: usize) {
        self.locks[index].release();
    }

    /// Acquire the lock for `index` and return a guard that releases it.
    #[inline]
    pub fn lock(&self, index: usize) -> BucketGuard<'_> {
        self.acquire(index);
        BucketGuard { table: self, index }
    }

    /// Whether the lock for `index` is currently held by anyone.
    #[inline]
    pub fn is_locked(&self, index: usize) -> bool {
        self.locks[index].state.load(Ordering::Relaxed) == LOCKED
    }
}

/// RAII guard for a held bucket lock.
pub struct BucketGuard<'a> {
    table: &'a BucketLockTable,
    index: usize,
}

impl BucketGuard<'_> {
    /// Index of the bucket this guard protects.
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }
}

impl Drop for BucketGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        self.table.release(self.index);
    }
}
