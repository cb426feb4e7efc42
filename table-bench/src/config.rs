//! Configuration for the table workload driver.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use table_core::{Admission, HugepageSize};

/// Top-level configuration.
#[derive(Deserialize)]
pub struct Config {
    pub general: GeneralConfig,
    pub table: TableConfig,
    pub workload: WorkloadConfig,
    /// Optional snapshot to load before and save after the run.
    #[serde(default)]
    pub snapshot: Option<SnapshotConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// General benchmark settings.
#[derive(Deserialize)]
pub struct GeneralConfig {
    /// How long to run the measurement phase.
    #[serde(deserialize_with = "deserialize_duration")]
    pub duration: Duration,
    /// How long to warm up before reporting.
    #[serde(deserialize_with = "deserialize_duration")]
    pub warmup: Duration,
    /// Number of worker threads.
    pub threads: usize,
    /// Optional list of CPU cores to pin workers to (e.g., "0-3,6-8").
    pub cpu_list: Option<String>,
}

/// Table construction parameters.
#[derive(Deserialize)]
pub struct TableConfig {
    /// Initial capacity in entries.
    pub init_capacity: usize,
    /// Upper bound on capacity. Defaults to unbounded.
    #[serde(default)]
    pub max_size: Option<usize>,
    /// Slots per bucket.
    #[serde(default = "default_bucket_max_size")]
    pub bucket_max_size: usize,
    /// Elements per value vector.
    pub dim: usize,
    /// Device budget for value storage (e.g., "4GB"). "0" keeps everything on host.
    #[serde(default = "default_zero_size", deserialize_with = "deserialize_size")]
    pub max_hbm: usize,
    /// Largest single value slice (e.g., "1GB").
    #[serde(default = "default_max_slice", deserialize_with = "deserialize_size")]
    pub max_slice: usize,
    /// Load factor that triggers automatic growth.
    #[serde(default = "default_load_factor")]
    pub max_load_factor: f64,
    /// Admission rule for caller-supplied metas.
    #[serde(default)]
    pub admission: AdmissionConfig,
    /// Request explicit 2MB hugepages for device slices.
    #[serde(default)]
    pub hugepages: bool,
    /// Entries per save/load transfer.
    #[serde(default = "default_io_batch_size")]
    pub io_batch_size: usize,
}

impl TableConfig {
    pub fn hugepage_size(&self) -> HugepageSize {
        if self.hugepages {
            HugepageSize::TwoMegabyte
        } else {
            HugepageSize::None
        }
    }
}

/// Admission rule as written in the config file.
#[derive(Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionConfig {
    #[default]
    NotSmaller,
    StrictlyLarger,
}

impl From<AdmissionConfig> for Admission {
    fn from(value: AdmissionConfig) -> Self {
        match value {
            AdmissionConfig::NotSmaller => Admission::NotSmaller,
            AdmissionConfig::StrictlyLarger => Admission::StrictlyLarger,
        }
    }
}

impl std::fmt::Display for AdmissionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdmissionConfig::NotSmaller => write!(f, "not_smaller"),
            AdmissionConfig::StrictlyLarger => write!(f, "strictly_larger"),
        }
    }
}

/// Workload configuration.
#[derive(Deserialize)]
pub struct WorkloadConfig {
    /// Whether to prefill the keyspace before measurement.
    #[serde(default)]
    pub prefill: bool,
    /// Number of distinct keys.
    pub keyspace: u64,
    /// Keys per batched operation.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Command mix (must sum to 100).
    pub commands: CommandsConfig,
}

/// Command mix (percentages, must sum to 100).
#[derive(Deserialize)]
pub struct CommandsConfig {
    pub find: u8,
    pub insert: u8,
    pub erase: u8,
}

/// Snapshot file location.
#[derive(Deserialize)]
pub struct SnapshotConfig {
    /// Base path; the table writes `<path>.keys`, `<path>.values` and `<path>.metas`.
    pub path: PathBuf,
    /// Load the snapshot before the run if it exists.
    #[serde(default)]
    pub load: bool,
    /// Save a snapshot after the run.
    #[serde(default)]
    pub save: bool,
}

/// Logging configuration.
#[derive(Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level filter used when RUST_LOG is unset.
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    /// Include timestamps.
    #[serde(default = "LoggingConfig::default_true")]
    pub timestamps: bool,
    /// Include the event target.
    #[serde(default)]
    pub target: bool,
    /// Include thread names.
    #[serde(default = "LoggingConfig::default_true")]
    pub thread_names: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            format: LogFormat::default(),
            timestamps: true,
            target: false,
            thread_names: true,
        }
    }
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_string()
    }

    fn default_true() -> bool {
        true
    }
}

/// Log output format.
#[derive(Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
    Compact,
}

fn default_bucket_max_size() -> usize {
    128
}

fn default_zero_size() -> usize {
    0
}

fn default_max_slice() -> usize {
    1024 * 1024 * 1024
}

fn default_load_factor() -> f64 {
    0.75
}

fn default_io_batch_size() -> usize {
    64 * 1024
}

fn default_batch_size() -> usize {
    1024
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let config: Config = toml::from_str(contents)?;

        let commands = &config.workload.commands;
        let total = commands.find as u16 + commands.insert as u16 + commands.erase as u16;
        if total != 100 {
            return Err(format!(
                "command mix must sum to 100 (got {}): find={} insert={} erase={}",
                total, commands.find, commands.insert, commands.erase,
            )
            .into());
        }

        if config.general.threads == 0 {
            return Err("threads must be at least 1".into());
        }
        if config.workload.keyspace == 0 {
            return Err("keyspace must be at least 1".into());
        }
        if config.workload.batch_size == 0 {
            return Err("batch_size must be at least 1".into());
        }

        Ok(config)
    }
}

/// Deserialize a duration from a human-readable string (e.g., "60s", "5m").
fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    humantime::parse_duration(&s).map_err(serde::de::Error::custom)
}

/// Deserialize a size from a human-readable string (e.g., "1GB", "512MB").
fn deserialize_size<'de, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_size(&s).map_err(serde::de::Error::custom)
}

/// Parse a size string like "1GB", "512MB", "4KB" into bytes.
fn parse_size(s: &str) -> Result<usize, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty size string".to_string());
    }

    let num_end = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(s.len());

    let (num_str, suffix) = s.split_at(num_end);
    let num: f64 = num_str
        .parse()
        .map_err(|e| format!("invalid number '{}': {}", num_str, e))?;

    let multiplier: usize = match suffix.trim().to_uppercase().as_str() {
        "" | "B" => 1,
        "KB" | "K" => 1024,
        "MB" | "M" => 1024 * 1024,
        "GB" | "G" => 1024 * 1024 * 1024,
        "TB" | "T" => 1024 * 1024 * 1024 * 1024,
        other => return Err(format!("unknown size suffix '{}'", other)),
    };

    Ok((num * multiplier as f64) as usize)
}

/// Parse a CPU list string like "0-3,6-8" into a Vec of CPU IDs.
pub fn parse_cpu_list(s: &str) -> Result<Vec<usize>, String> {
    let mut cpus = Vec::new();
    for part in s.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if let Some((start, end)) = part.split_once('-') {
            let start: usize = start
                .trim()
                .parse()
                .map_err(|e| format!("invalid CPU id '{}': {}", start, e))?;
            let end: usize = end
                .trim()
                .parse()
                .map_err(|e| format!("invalid CPU id '{}': {}", end, e))?;
            if start > end {
                return Err(format!("invalid range {}-{}", start, end));
            }
            cpus.extend(start..=end);
        } else {
            let cpu: usize = part
                .parse()
                .map_err(|e| format!("invalid CPU id '{}': {}", part, e))?;
            cpus.push(cpu);
        }
    }
    Ok(cpus)
}
