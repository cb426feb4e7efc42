//! Structured logging initialization.
//!
//! The RUST_LOG environment variable takes precedence over the configured level.

use crate::config::{LogFormat, LoggingConfig};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Install the global tracing subscriber.
pub fn init(config: &LoggingConfig) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(config.level.as_str())
    };

    // Benchmark output goes to stdout, so logs stay on stderr.
    let base = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(config.target)
        .with_thread_names(config.thread_names);

    match (config.format, config.timestamps) {
        (LogFormat::Pretty, true) => {
            let subscriber = tracing_subscriber::registry()
                .with(filter)
                .with(base.with_ansi(true));
            subscriber.init();
        }
        (LogFormat::Pretty, false) => {
            let subscriber = tracing_subscriber::registry()
                .with(filter)
                .with(base.with_ansi(true).without_time());
            subscriber.init();
        }
        (LogFormat::Json, true) => {
            let subscriber = tracing_subscriber::registry().with(filter).with(base.json());
            subscriber.init();
        }
        (LogFormat::Json, false) => {
            let subscriber = tracing_subscriber::registry()
                .with(filter)
                .with(base.json().without_time());
            subscriber.init();
        }
        (LogFormat::Compact, true) => {
            let subscriber = tracing_subscriber::registry()
                .with(filter)
                .with(base.compact().with_ansi(true));
            subscriber.init();
        }
        (LogFormat::Compact, false) => {
            let subscriber = tracing_subscriber::registry()
                .with(filter)
                .with(base.compact().with_ansi(true).without_time());
            subscriber.init();
        }
    }
}
