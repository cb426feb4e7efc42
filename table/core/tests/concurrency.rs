//! Concurrent access tests for Table.
//!
//! Many threads share one table through `Arc` while each batch also fans
//! out across the rayon pool.

#![cfg(not(feature = "loom"))]

use std::sync::Arc;
use std::thread;
use table_core::{InsertStatus, Table};

const DIM: usize = 8;

/// Vector whose elements are derived from the key.
fn vector_for(key: u64) -> [f32; DIM] {
    std::array::from_fn(|j| (key as f32) + j as f32 * 0.25)
}

fn vectors_for(keys: &[u64]) -> Vec<f32> {
    keys.iter().flat_map(|k| vector_for(*k)).collect()
}

fn verify(table: &Table<u64, f32>, keys: &[u64]) -> usize {
    let result = table.find(keys);
    for (i, key) in keys.iter().enumerate() {
        if let Some(value) = result.value(i) {
            assert_eq!(value, &vector_for(*key), "corrupted value for key {key}");
        }
    }
    result.hits()
}

#[test]
fn test_disjoint_writers_no_eviction() {
    const THREADS: u64 = 8;
    const PER_THREAD: u64 = 4_000;

    let table: Arc<Table<u64, f32>> = Arc::new(
        Table::builder()
            .init_capacity(256 * 1024)
            .bucket_max_size(128)
            .dim(DIM)
            .build()
            .expect("Failed to create table"),
    );

    thread::scope(|s| {
        for t in 0..THREADS {
            let table = table.clone();
            s.spawn(move || {
                let keys: Vec<u64> = (t * PER_THREAD..(t + 1) * PER_THREAD).collect();
                for chunk in keys.chunks(500) {
                    let statuses = table
                        .insert_or_assign(chunk, &vectors_for(chunk), None)
                        .expect("insert failed");
                    assert!(statuses.iter().all(|s| *s == InsertStatus::Inserted));
                }
            });
        }
    });

    assert_eq!(table.size(), (THREADS * PER_THREAD) as usize);
    let all: Vec<u64> = (0..THREADS * PER_THREAD).collect();
    assert_eq!(verify(&table, &all), all.len());
}

#[test]
fn test_readers_and_writers() {
    let table: Arc<Table<u64, f32>> = Arc::new(
        Table::builder()
            .init_capacity(64 * 1024)
            .bucket_max_size(64)
            .dim(DIM)
            .build()
            .expect("Failed to create table"),
    );

    let seed: Vec<u64> = (0..10_000).collect();
    table.insert_or_assign(&seed, &vectors_for(&seed), None).unwrap();

    thread::scope(|s| {
        for _ in 0..4 {
            let table = table.clone();
            let seed = &seed;
            s.spawn(move || {
                for _ in 0..20 {
                    verify(&table, seed);
                }
            });
        }
        for t in 0..4u64 {
            let table = table.clone();
            s.spawn(move || {
                for round in 0..20u64 {
                    let base = 1_000_000 + (t * 20 + round) * 100;
                    let keys: Vec<u64> = (base..base + 100).collect();
                    table.insert_or_assign(&keys, &vectors_for(&keys), None).unwrap();
                    table.erase(&keys[..50]);
                }
            });
        }
    });

    // 10k seeded keys plus 4 writers * 20 rounds * 50 surviving keys.
    assert_eq!(table.size(), 10_000 + 4 * 20 * 50);
    assert_eq!(verify(&table, &seed), seed.len());
}

#[test]
fn test_concurrent_growth_keeps_accounting() {
    const THREADS: u64 = 6;
    const PER_THREAD: u64 = 6_000;

    // Starts at 1024 slots and has to double repeatedly while writers run.
    let table: Arc<Table<u64, f32>> = Arc::new(
        Table::builder()
            .init_capacity(1024)
            .bucket_max_size(32)
            .dim(DIM)
            .build()
            .expect("Failed to create table"),
    );

    thread::scope(|s| {
        for t in 0..THREADS {
            let table = table.clone();
            s.spawn(move || {
                let keys: Vec<u64> = (t * PER_THREAD..(t + 1) * PER_THREAD).collect();
                for chunk in keys.chunks(200) {
                    table
                        .insert_or_assign(chunk, &vectors_for(chunk), None)
                        .expect("insert failed");
                }
            });
        }
    });

    let metrics = table.metrics();
    assert!(metrics.counters.resizes > 0);
    assert!(table.capacity() > 1024);

    // Evictions swap one key for another; only fresh slots grow the table.
    assert_eq!(metrics.counters.inserts as usize, table.size());
    assert_eq!(
        metrics.counters.insert_attempts(),
        THREADS * PER_THREAD,
        "every key attempted exactly once"
    );

    let all: Vec<u64> = (0..THREADS * PER_THREAD).collect();
    assert_eq!(verify(&table, &all), table.size());

    for index in 0..table.bucket_count() {
        table.inspect_bucket(index, |bucket| {
            assert!(bucket.min_cache_is_exact(), "bucket {index} min cache stale");
        });
    }
}

#[test]
fn test_concurrent_updates_same_keys() {
    let table: Arc<Table<u64, f32>> = Arc::new(
        Table::builder()
            .init_capacity(4096)
            .bucket_max_size(16)
            .dim(DIM)
            .build()
            .expect("Failed to create table"),
    );
    let keys: Vec<u64> = (0..500).collect();
    table.insert_or_assign(&keys, &vectors_for(&keys), None).unwrap();

    thread::scope(|s| {
        for _ in 0..8 {
            let table = table.clone();
            let keys = &keys;
            s.spawn(move || {
                for _ in 0..10 {
                    let statuses = table
                        .insert_or_assign(keys, &vectors_for(keys), None)
                        .unwrap();
                    assert!(statuses.iter().all(|s| *s == InsertStatus::Updated));
                }
            });
        }
    });

    assert_eq!(table.size(), 500);
    assert_eq!(verify(&table, &keys), 500);
}
