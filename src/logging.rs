// src/logging.rs - env_logger setup from config

use crate::config::{parse_log_level, LoggingConfig};
use crate::error::{Error, Result};

/// Initializes the global logger.
///
/// The configured level applies crate-wide; the `LOG_LEVEL` environment
/// variable overrides it with a full env_logger filter expression. When a
/// log file is configured, output goes there instead of stderr.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let level = parse_log_level(&config.level)?;

    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);
    if let Ok(filter) = std::env::var("LOG_LEVEL") {
        builder.parse_filters(&filter);
    }

    if let Some(path) = &config.file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| Error::ConfigInvalid(format!("logging.file {}: {}", path.display(), e)))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }

    builder
        .try_init()
        .map_err(|e| Error::ConfigInvalid(format!("logger init failed: {e}")))
}
