//! Logging setup: stdout plus a non-blocking file writer.
//!
//! The filter defaults to the configured level and can be overridden with
//! `RUST_LOG`.

use std::fs;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use cb_types::{config_error, CbResult};

use crate::config::LoggingConfig;

/// Keeps the file writer alive. Dropping it flushes buffered log lines.
pub struct LoggingGuard {
    _file_guard: WorkerGuard,
}

impl LoggingGuard {
    /// Flush and close the file writer.
    pub fn flush(self) {
        drop(self);
    }
}

/// Install the global subscriber. Call once, before any worker starts.
pub fn init_logging(config: &LoggingConfig) -> CbResult<LoggingGuard> {
    fs::create_dir_all(&config.dir)?;
    let log_path = Path::new(&config.dir).join(&config.file);
    // Each run starts a fresh file.
    fs::write(&log_path, "")?;

    let file_appender = tracing_appender::rolling::never(&config.dir, &config.file);
    let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking_file)
        .with_ansi(false)
        .with_thread_names(true)
        .with_target(true);

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stdout)
        .with_thread_names(true);

    let env_filter = default_filter(&config.level)?;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .try_init()
        .map_err(|e| config_error!("logging already initialized: {}", e))?;

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}

fn default_filter(level: &str) -> CbResult<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(level).map_err(|e| config_error!("invalid log level '{}': {}", level, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_directive_parsing() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        assert!(default_filter("debug").is_ok());
        assert!(default_filter("cb_control=trace,info").is_ok());
    }

    #[test]
    fn test_defaults() {
        let config = LoggingConfig::default();
        assert_eq!(config.dir, "logs");
        assert_eq!(config.file, "coolback.log");
        assert_eq!(config.level, "info");
    }
}
