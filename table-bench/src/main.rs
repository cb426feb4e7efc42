//! In-process workload driver for the tiered table. Exercises batched
//! find/insert/erase directly against `table_core::Table`.

mod config;
mod logging;
mod metrics;
mod worker;

use crate::config::Config;
use crate::worker::{Phase, SharedState};

use clap::Parser;
use metriken::{AtomicHistogram, histogram::Histogram};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use table_core::{CounterSnapshot, LocalKvFile, Table};

#[derive(Parser)]
#[command(name = "table-bench")]
#[command(about = "In-process tiered table benchmark")]
struct Args {
    /// Path to configuration file
    config: PathBuf,
}

fn main() {
    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            std::process::exit(1);
        }
    };

    logging::init(&config.logging);

    if let Err(e) = run(config) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn build_table(config: &Config) -> Result<Table<u64, f32>, Box<dyn std::error::Error>> {
    let t = &config.table;
    let mut builder = Table::builder()
        .init_capacity(t.init_capacity)
        .bucket_max_size(t.bucket_max_size)
        .dim(t.dim)
        .max_hbm_for_vectors(t.max_hbm)
        .max_slice_bytes(t.max_slice)
        .max_load_factor(t.max_load_factor)
        .admission(t.admission.into())
        .hugepage_size(t.hugepage_size())
        .io_batch_size(t.io_batch_size);
    if let Some(max_size) = t.max_size {
        builder = builder.max_size(max_size);
    }
    Ok(builder.build()?)
}

fn snapshot_exists(base: &Path) -> bool {
    let mut keys = base.as_os_str().to_owned();
    keys.push(".keys");
    Path::new(&keys).exists()
}

fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    print_config(&config);

    let table = Arc::new(build_table(&config)?);
    let dim = config.table.dim;

    if let Some(snapshot) = &config.snapshot
        && snapshot.load
        && snapshot_exists(&snapshot.path)
    {
        let start = Instant::now();
        let mut file = LocalKvFile::open::<u64, f32, u64>(&snapshot.path, dim)?;
        let loaded = table.load(&mut file)?;
        tracing::info!(
            entries = loaded,
            elapsed_ms = start.elapsed().as_millis() as u64,
            path = %snapshot.path.display(),
            "snapshot loaded"
        );
    }

    let num_threads = config.general.threads;
    let warmup = config.general.warmup;
    let duration = config.general.duration;

    let cpu_ids = match &config.general.cpu_list {
        Some(list) => Some(config::parse_cpu_list(list)?),
        None => None,
    };

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let shared = Arc::new(SharedState::new());

    // Split the keyspace into contiguous prefill ranges.
    let keyspace = config.workload.keyspace;
    let prefill_ranges: Vec<Option<std::ops::Range<u64>>> = (0..num_threads as u64)
        .map(|id| {
            if config.workload.prefill {
                let per = keyspace / num_threads as u64;
                let start = id * per;
                let end = if id == num_threads as u64 - 1 {
                    keyspace
                } else {
                    start + per
                };
                Some(start..end)
            } else {
                None
            }
        })
        .collect();

    if config.workload.prefill {
        eprintln!("prefilling {keyspace} keys across {num_threads} threads...");
        shared.set_phase(Phase::Prefill);
    } else {
        shared.set_phase(Phase::Warmup);
    }

    let config = Arc::new(config);
    let mut handles = Vec::with_capacity(num_threads);

    for (id, prefill_range) in prefill_ranges.into_iter().enumerate() {
        let table = Arc::clone(&table);
        let shared = Arc::clone(&shared);
        let cpu_ids = cpu_ids.clone();
        let config = Arc::clone(&config);

        let handle = thread::Builder::new()
            .name(format!("worker-{id}"))
            .spawn(move || {
                if let Some(ref ids) = cpu_ids
                    && !ids.is_empty()
                {
                    let _ = pin_to_cpu(ids[id % ids.len()]);
                }
                worker::run_worker(id, &config, &table, &shared, prefill_range);
            })?;

        handles.push(handle);
    }

    // Main thread: reporting loop
    let start = Instant::now();
    let report_interval = Duration::from_secs(1);
    let mut last_report = Instant::now();
    let mut last_batches = 0u64;
    let mut last_keys = 0u64;
    let mut last_counters = table.metrics().counters;
    let mut run_start_counters = last_counters;
    let mut last_histogram: Option<Histogram> = None;
    let mut current_phase = shared.phase();
    let mut warmup_start = if current_phase == Phase::Prefill {
        None
    } else {
        Some(start)
    };

    loop {
        thread::sleep(Duration::from_millis(100));

        if !running.load(Ordering::SeqCst) {
            shared.set_phase(Phase::Stop);
            break;
        }

        if current_phase == Phase::Prefill {
            if shared.prefill_complete_count() >= num_threads {
                shared.set_phase(Phase::Warmup);
                current_phase = Phase::Warmup;
                warmup_start = Some(Instant::now());
                eprintln!(
                    "prefill complete ({} entries), warming up for {:?}...",
                    table.size(),
                    warmup
                );
            }
            continue;
        }

        let elapsed = warmup_start.unwrap_or(start).elapsed();

        if elapsed >= warmup + duration {
            shared.set_phase(Phase::Stop);
            break;
        }

        if current_phase == Phase::Warmup && elapsed >= warmup {
            shared.set_phase(Phase::Running);
            current_phase = Phase::Running;
            eprintln!("running for {duration:?}...");
            print_header();
            last_report = Instant::now();
            last_batches = shared.batches();
            last_keys = shared.keys();
            last_counters = table.metrics().counters;
            run_start_counters = last_counters;
            last_histogram = metrics::BATCH_LATENCY.load();
        }

        if current_phase != Phase::Running {
            continue;
        }

        if last_report.elapsed() >= report_interval {
            let elapsed_secs = last_report.elapsed().as_secs_f64();
            let batches = shared.batches();
            let keys = shared.keys();
            let stats = table.metrics();
            let delta = stats.counters.diff(&last_counters);

            // Interval percentiles via wrapping_sub
            let current_histogram = metrics::BATCH_LATENCY.load();
            let (p50, p90, p99, p999, max) = match (&current_histogram, &last_histogram) {
                (Some(current), Some(previous)) => match current.wrapping_sub(previous) {
                    Ok(delta) => latency_row(&delta),
                    Err(_) => (0.0, 0.0, 0.0, 0.0, 0.0),
                },
                (Some(current), None) => latency_row(current),
                _ => (0.0, 0.0, 0.0, 0.0, 0.0),
            };
            last_histogram = current_histogram;

            println!(
                "{:>12.0} {:>12.0} {:>7.1}% {:>10} {:>10} {:>7.3} {:>6} {:>10.1} {:>10.1} {:>10.1} {:>10.1} {:>10.1}",
                (batches - last_batches) as f64 / elapsed_secs,
                (keys - last_keys) as f64 / elapsed_secs,
                delta.hit_rate(),
                delta.evictions,
                stats.size,
                stats.load_factor(),
                stats.counters.resizes,
                p50,
                p90,
                p99,
                p999,
                max,
            );

            last_batches = batches;
            last_keys = keys;
            last_counters = stats.counters;
            last_report = Instant::now();
        }
    }

    for handle in handles {
        let _ = handle.join();
    }

    let totals = table.metrics().counters.diff(&run_start_counters);
    print_summary(&config, &table, &shared, &totals);

    if let Some(snapshot) = &config.snapshot
        && snapshot.save
    {
        let start = Instant::now();
        let mut file = LocalKvFile::create::<u64, f32, u64>(&snapshot.path, dim)?;
        let saved = table.save(&mut file)?;
        file.sync()?;
        tracing::info!(
            entries = saved,
            elapsed_ms = start.elapsed().as_millis() as u64,
            path = %snapshot.path.display(),
            "snapshot saved"
        );
    }

    Ok(())
}

fn print_config(config: &Config) {
    let t = &config.table;
    eprintln!("table-bench configuration:");
    eprintln!("  capacity:   {} (max {:?})", t.init_capacity, t.max_size);
    eprintln!("  buckets:    {} slots", t.bucket_max_size);
    eprintln!("  dim:        {} x f32", t.dim);
    eprintln!("  max_hbm:    {} bytes", t.max_hbm);
    eprintln!("  max_slice:  {} bytes", t.max_slice);
    eprintln!("  load:       {}", t.max_load_factor);
    eprintln!("  admission:  {}", t.admission);
    eprintln!("  threads:    {}", config.general.threads);
    eprintln!("  duration:   {:?}", config.general.duration);
    eprintln!("  warmup:     {:?}", config.general.warmup);
    eprintln!(
        "  commands:   find={} insert={} erase={}",
        config.workload.commands.find,
        config.workload.commands.insert,
        config.workload.commands.erase,
    );
    eprintln!(
        "  keyspace:   {} keys, {} per batch",
        config.workload.keyspace, config.workload.batch_size,
    );
    eprintln!();
}

fn print_header() {
    println!(
        "{:>12} {:>12} {:>8} {:>10} {:>10} {:>7} {:>6} {:>10} {:>10} {:>10} {:>10} {:>10}",
        "batches/sec",
        "keys/sec",
        "hit%",
        "evicted",
        "size",
        "load",
        "grows",
        "p50(us)",
        "p90(us)",
        "p99(us)",
        "p999(us)",
        "max(us)",
    );
    println!("{}", "-".repeat(126));
}

fn print_summary(
    config: &Config,
    table: &Table<u64, f32>,
    shared: &SharedState,
    totals: &CounterSnapshot,
) {
    let stats = table.metrics();
    let elapsed = config.general.duration.as_secs_f64();
    let keys = shared.keys();
    let avg_rate = if elapsed > 0.0 { keys as f64 / elapsed } else { 0.0 };

    eprintln!();
    eprintln!("=== Final Summary ===");
    eprintln!("  batches:      {}", shared.batches());
    eprintln!("  keys:         {keys}");
    eprintln!("  avg keys/sec: {avg_rate:.0}");
    eprintln!(
        "  finds:        {} (hit rate {:.1}%)",
        totals.finds,
        totals.hit_rate(),
    );
    eprintln!(
        "  inserts:      {} new, {} updated, {} evicted, {} rejected",
        totals.inserts, totals.updates, totals.evictions, totals.rejections,
    );
    eprintln!("  erases:       {}", totals.erases);
    eprintln!("  errors:       {}", shared.errors());
    eprintln!();
    eprintln!("  size:         {} / {}", stats.size, stats.capacity);
    eprintln!("  buckets:      {}", stats.buckets);
    eprintln!("  resizes:      {}", stats.counters.resizes);
    eprintln!(
        "  device:       {} bytes in {} slices ({} bytes budget left)",
        stats.tiers.device_bytes, stats.tiers.device_slices, stats.remaining_hbm,
    );
    eprintln!(
        "  host:         {} bytes in {} slices",
        stats.tiers.host_bytes, stats.tiers.host_slices,
    );
    eprintln!();

    // Per-operation batch latency
    print_latency_summary("FIND", &metrics::FIND_LATENCY);
    print_latency_summary("INSERT", &metrics::INSERT_LATENCY);
    if totals.erases > 0 {
        print_latency_summary("ERASE", &metrics::ERASE_LATENCY);
    }
    print_latency_summary("ALL", &metrics::BATCH_LATENCY);
}

fn print_latency_summary(label: &str, hist: &AtomicHistogram) {
    let p50 = percentile(hist, 50.0) / 1000.0;
    let p90 = percentile(hist, 90.0) / 1000.0;
    let p99 = percentile(hist, 99.0) / 1000.0;
    let p999 = percentile(hist, 99.9) / 1000.0;
    let max = max_percentile(hist) / 1000.0;

    eprintln!(
        "  {label:<6} latency (us): p50={p50:.1}  p90={p90:.1}  p99={p99:.1}  p999={p999:.1}  max={max:.1}",
    );
}

// --- Histogram helpers ---

/// p50, p90, p99, p999 and max of a histogram in microseconds.
fn latency_row(hist: &Histogram) -> (f64, f64, f64, f64, f64) {
    (
        percentile_from_histogram(hist, 50.0) / 1000.0,
        percentile_from_histogram(hist, 90.0) / 1000.0,
        percentile_from_histogram(hist, 99.0) / 1000.0,
        percentile_from_histogram(hist, 99.9) / 1000.0,
        max_from_histogram(hist) / 1000.0,
    )
}

fn percentile(hist: &AtomicHistogram, p: f64) -> f64 {
    if let Some(snapshot) = hist.load() {
        percentile_from_histogram(&snapshot, p)
    } else {
        0.0
    }
}

fn percentile_from_histogram(hist: &Histogram, p: f64) -> f64 {
    if let Ok(Some(results)) = hist.percentiles(&[p])
        && let Some((_pct, bucket)) = results.first()
    {
        return bucket.end() as f64;
    }
    0.0
}

fn max_percentile(hist: &AtomicHistogram) -> f64 {
    if let Some(snapshot) = hist.load() {
        max_from_histogram(&snapshot)
    } else {
        0.0
    }
}

fn max_from_histogram(hist: &Histogram) -> f64 {
    percentile_from_histogram(hist, 100.0)
}

// --- CPU pinning ---

#[cfg(target_os = "linux")]
fn pin_to_cpu(cpu_id: usize) -> std::io::Result<()> {
    use std::mem;

    unsafe {
        let mut cpuset: libc::cpu_set_t = mem::zeroed();
        libc::CPU_ZERO(&mut cpuset);
        libc::CPU_SET(cpu_id, &mut cpuset);

        let result = libc::sched_setaffinity(0, mem::size_of::<libc::cpu_set_t>(), &cpuset);

        if result == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn pin_to_cpu(_cpu_id: usize) -> std::io::Result<()> {
    Ok(())
}
