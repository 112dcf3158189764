//! Logging initialization shared by all services.
//!
//! Wraps `tracing-subscriber` with an env-filter, a console layer and an
//! optional rolling file layer.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing_appender::rolling;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub use tracing::{debug, error, info, instrument, trace, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level filter (trace, debug, info, warn, error). `RUST_LOG` takes
    /// precedence when set.
    pub level: String,

    /// Directory for log files. `None` disables file logging.
    pub log_dir: Option<PathBuf>,

    /// Prefix for log file names.
    pub file_prefix: String,

    /// Log rotation: "hourly", "daily", "never".
    pub rotation: String,

    /// Emit JSON-formatted events.
    pub json_format: bool,

    /// Also log to stdout.
    pub console_output: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: "info".into(),
            log_dir: None,
            file_prefix: "flamefs".into(),
            rotation: "hourly".into(),
            json_format: false,
            console_output: true,
        }
    }
}

/// Install the global subscriber. Call once at startup; the returned guard
/// must stay alive for the lifetime of the process so the non-blocking file
/// writer flushes.
pub fn init_logging(config: &LogConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let registry = tracing_subscriber::registry().with(env_filter);

    let console_layer: Option<Box<dyn tracing_subscriber::Layer<_> + Send + Sync>> =
        if config.console_output {
            if config.json_format {
                Some(Box::new(fmt::layer().json()))
            } else {
                Some(Box::new(fmt::layer()))
            }
        } else {
            None
        };

    let (file_layer, guard): (
        Option<Box<dyn tracing_subscriber::Layer<_> + Send + Sync>>,
        Option<tracing_appender::non_blocking::WorkerGuard>,
    ) = match &config.log_dir {
        Some(log_dir) => {
            let rotation = match config.rotation.as_str() {
                "daily" => rolling::Rotation::DAILY,
                "never" => rolling::Rotation::NEVER,
                _ => rolling::Rotation::HOURLY,
            };

            let file_appender = rolling::RollingFileAppender::builder()
                .rotation(rotation)
                .filename_prefix(&config.file_prefix)
                .filename_suffix("log")
                .build(log_dir)
                .expect("failed to create rolling file appender");

            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

            let layer: Box<dyn tracing_subscriber::Layer<_> + Send + Sync> = if config.json_format
            {
                Box::new(fmt::layer().json().with_writer(non_blocking))
            } else {
                Box::new(fmt::layer().with_writer(non_blocking))
            };

            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    registry.with(console_layer).with(file_layer).init();

    guard
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LogConfig::default();
        assert_eq!(config.level, "info");
        assert!(config.log_dir.is_none());
        assert!(config.console_output);
        assert!(!config.json_format);
    }
}
