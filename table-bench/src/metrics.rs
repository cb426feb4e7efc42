//! Batch latency histograms for the workload driver.

use metriken::{AtomicHistogram, metric};

#[metric(
    name = "batch_latency",
    description = "Latency of every measured batch (nanoseconds)"
)]
pub static BATCH_LATENCY: AtomicHistogram = AtomicHistogram::new(7, 64);

#[metric(
    name = "find_latency",
    description = "Find batch latency histogram (nanoseconds)"
)]
pub static FIND_LATENCY: AtomicHistogram = AtomicHistogram::new(7, 64);

#[metric(
    name = "insert_latency",
    description = "Insert batch latency histogram (nanoseconds)"
)]
pub static INSERT_LATENCY: AtomicHistogram = AtomicHistogram::new(7, 64);

#[metric(
    name = "erase_latency",
    description = "Erase batch latency histogram (nanoseconds)"
)]
pub static ERASE_LATENCY: AtomicHistogram = AtomicHistogram::new(7, 64);

/// Record one measured batch in its operation histogram and the combined one.
#[inline]
pub fn record(hist: &AtomicHistogram, nanos: u64) {
    let _ = hist.increment(nanos);
    let _ = BATCH_LATENCY.increment(nanos);
}
