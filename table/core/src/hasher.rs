//! Key hashing.
//!
//! The table routes a key with a single 64-bit hash: the low bits select
//! the bucket and the high 32 bits select the slot where the probe starts.

use crate::element::Key;
use ahash::RandomState;

/// Hash function used to place keys.
///
/// Implementations must be deterministic for the lifetime of a table.
pub trait KeyHasher<K>: Send + Sync {
    /// Hash a key.
    fn hash(&self, key: &K) -> u64;
}

/// Default hasher backed by `ahash`.
#[derive(Clone)]
pub struct DefaultKeyHasher {
    state: RandomState,
}

impl DefaultKeyHasher {
    /// Create a hasher with random seeds.
    pub fn new() -> Self {
        // Use fixed seeds in tests for deterministic placement
        #[cfg(test)]
        let state = RandomState::with_seeds(
            0xbb8c484891ec6c86,
            0x0522a25ae9c769f9,
            0xeed2797b9571bc75,
            0x4feb29c1fbbd59d0,
        );
        #[cfg(not(test))]
        let state = RandomState::new();

        Self { state }
    }

    /// Create a hasher with explicit seeds.
    pub fn with_seeds(k0: u64, k1: u64, k2: u64, k3: u64) -> Self {
        Self {
            state: RandomState::with_seeds(k0, k1, k2, k3),
        }
    }
}

impl Default for DefaultKeyHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Key> KeyHasher<K> for DefaultKeyHasher {
    #[inline]
    fn hash(&self, key: &K) -> u64 {
        self.state.hash_one(key)
    }
}

impl<K, F> KeyHasher<K> for F
where
    F: Fn(&K) -> u64 + Send + Sync,
{
    #[inline]
    fn hash(&self, key: &K) -> u64 {
        self(key)
    }
}
