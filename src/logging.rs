//! Logging initialization: a `tracing-subscriber` stack with an optional
//! rolling file appender, modeled on `libs/common/src/logging.rs` but
//! trimmed to what this service needs (no gzip rotation, no reload handle).

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// Initializes global tracing. Returns a guard that must be held for the
/// lifetime of the process to keep the non-blocking file writer flushing.
pub fn init(config: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    let stdout_layer = fmt::layer().with_target(false);

    match (&config.log_dir, &config.log_file) {
        (Some(dir), Some(file)) => {
            if let Err(e) = std::fs::create_dir_all(Path::new(dir)) {
                eprintln!("failed to create log directory {dir}: {e}");
            }
            let appender = tracing_appender::rolling::daily(dir, file);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let file_layer = fmt::layer().with_ansi(false).with_writer(non_blocking);

            tracing_subscriber::registry()
                .with(filter)
                .with(stdout_layer)
                .with(file_layer)
                .init();

            Some(guard)
        }
        _ => {
            tracing_subscriber::registry().with(filter).with(stdout_layer).init();
            None
        }
    }
}
