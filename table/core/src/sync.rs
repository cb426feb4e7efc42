//! Synchronization primitives with optional loom support.
//!
//! Bucket locks are built from these types so the locking protocol can be
//! model checked with loom while production builds use plain std atomics.

#[cfg(not(feature = "loom"))]
pub use std::sync::atomic::{AtomicU32, Ordering};

#[cfg(feature = "loom")]
pub use loom::sync::atomic::{AtomicU32, Ordering};

/// Spin loop hint for busy waiting.
///
/// In production this is `std::hint::spin_loop()`. Under loom it yields so
/// the model checker can schedule the lock holder.
#[inline]
pub fn spin_loop() {
    #[cfg(not(feature = "loom"))]
    std::hint::spin_loop();

    #[cfg(feature = "loom")]
    loom::thread::yield_now();
}
