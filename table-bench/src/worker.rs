//! Worker thread driving batched table operations.

use crate::config::Config;
use crate::metrics;

use rand::prelude::*;
use rand_xoshiro::Xoshiro256PlusPlus;
use std::ops::Range;
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;
use table_core::Table;

/// Test phase, controlled by main thread and read by workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    /// Insert each key of the worker's range exactly once.
    Prefill = 0,
    /// Run the workload without counting operations.
    Warmup = 1,
    /// Measurement phase.
    Running = 2,
    /// Workers should exit.
    Stop = 3,
}

impl Phase {
    #[inline]
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Phase::Prefill,
            1 => Phase::Warmup,
            2 => Phase::Running,
            _ => Phase::Stop,
        }
    }
}

/// Shared state between main thread and workers.
pub struct SharedState {
    phase: AtomicU8,
    prefill_complete: AtomicUsize,
    batches: AtomicU64,
    keys: AtomicU64,
    errors: AtomicU64,
}

impl SharedState {
    pub fn new() -> Self {
        Self {
            phase: AtomicU8::new(Phase::Prefill as u8),
            prefill_complete: AtomicUsize::new(0),
            batches: AtomicU64::new(0),
            keys: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn set_phase(&self, phase: Phase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    pub fn mark_prefill_complete(&self) {
        self.prefill_complete.fetch_add(1, Ordering::Release);
    }

    pub fn prefill_complete_count(&self) -> usize {
        self.prefill_complete.load(Ordering::Acquire)
    }

    /// Batches completed during the running phase.
    pub fn batches(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }

    /// Keys processed during the running phase.
    pub fn keys(&self) -> u64 {
        self.keys.load(Ordering::Relaxed)
    }

    /// Batches that returned an error.
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    fn record_batch(&self, keys: usize) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.keys.fetch_add(keys as u64, Ordering::Relaxed);
    }
}

/// Deterministic vector for a key so readers can spot torn values.
fn fill_value(buf: &mut [f32], key: u64, generation: u32) {
    let base = key as f32 + generation as f32;
    for (j, v) in buf.iter_mut().enumerate() {
        *v = base + j as f32;
    }
}

/// Run a single worker thread.
pub fn run_worker(
    id: usize,
    config: &Config,
    table: &Table<u64, f32>,
    shared: &SharedState,
    prefill_range: Option<Range<u64>>,
) {
    let batch = config.workload.batch_size;
    let keyspace = config.workload.keyspace;
    let dim = table.dim();
    let find_threshold = config.workload.commands.find;
    let insert_threshold = find_threshold + config.workload.commands.insert;

    let mut keys = vec![0u64; batch];
    let mut values = vec![0f32; batch * dim];
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(42 + id as u64);
    let mut generation = 0u32;

    if let Some(range) = prefill_range {
        let all: Vec<u64> = range.collect();
        for chunk in all.chunks(batch) {
            let values = &mut values[..chunk.len() * dim];
            for (key, value) in chunk.iter().zip(values.chunks_mut(dim)) {
                fill_value(value, *key, 0);
            }
            if let Err(e) = table.insert_or_assign(chunk, values, None) {
                tracing::warn!(worker = id, error = %e, "prefill batch failed");
                shared.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
    shared.mark_prefill_complete();

    loop {
        let phase = shared.phase();
        match phase {
            Phase::Prefill => {
                std::hint::spin_loop();
                continue;
            }
            Phase::Stop => break,
            Phase::Warmup | Phase::Running => {}
        }

        for key in keys.iter_mut() {
            *key = rng.random_range(0..keyspace);
        }

        let roll: u8 = rng.random_range(0..100);
        let start = Instant::now();
        let histogram = if roll < find_threshold {
            let result = table.find(&keys);
            debug_assert_eq!(result.len(), keys.len());
            &metrics::FIND_LATENCY
        } else if roll < insert_threshold {
            generation = generation.wrapping_add(1);
            for (key, value) in keys.iter().zip(values.chunks_mut(dim)) {
                fill_value(value, *key, generation);
            }
            if let Err(e) = table.insert_or_assign(&keys, &values, None) {
                tracing::debug!(worker = id, error = %e, "insert batch failed");
                shared.errors.fetch_add(1, Ordering::Relaxed);
            }
            &metrics::INSERT_LATENCY
        } else {
            table.erase(&keys);
            &metrics::ERASE_LATENCY
        };
        let elapsed = start.elapsed().as_nanos() as u64;

        if phase == Phase::Running {
            shared.record_batch(keys.len());
            metrics::record(histogram, elapsed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_from_u8() {
        for phase in [Phase::Prefill, Phase::Warmup, Phase::Running, Phase::Stop] {
            assert_eq!(Phase::from_u8(phase as u8), phase);
        }
        assert_eq!(Phase::from_u8(200), Phase::Stop);
    }

    #[test]
    fn test_fill_value() {
        let mut buf = [0.0f32; 4];
        fill_value(&mut buf, 10, 2);
        assert_eq!(buf, [12.0, 13.0, 14.0, 15.0]);
    }

    #[test]
    fn test_worker_prefills_and_stops() {
        let config = Config::parse(
            r#"
            [general]
            duration = "1s"
            warmup = "0s"
            threads = 1

            [table]
            init_capacity = 4096
            dim = 4

            [workload]
            keyspace = 1000
            batch_size = 64
            commands = { find = 100, insert = 0, erase = 0 }
            "#,
        )
        .unwrap();
        let table: Table<u64, f32> = Table::builder()
            .init_capacity(4096)
            .dim(4)
            .build()
            .unwrap();

        let shared = SharedState::new();
        shared.set_phase(Phase::Stop);
        run_worker(0, &config, &table, &shared, Some(0..1000));

        assert_eq!(shared.prefill_complete_count(), 1);
        assert_eq!(table.size(), 1000);
        assert_eq!(shared.batches(), 0);
        let result = table.find(&[7]);
        assert_eq!(result.value(0), Some(&[7.0f32, 8.0, 9.0, 10.0][..]));
    }
}
