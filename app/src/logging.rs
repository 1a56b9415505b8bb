//! Environment-driven logging setup (compact or JSON, always on stderr)
//!
//! - `MF_LOG_LEVEL`: filter directive, default `info`; `RUST_LOG` is used when unset
//! - `MF_LOG_FORMAT`: `compact` (default) or `json`
//!
//! stdout stays reserved for command output.

use anyhow::Result;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGING_CONFIG: OnceLock<LoggingConfig> = OnceLock::new();

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub format: LogFormat,
    pub level: String,
}

/// Supported log output formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable compact format
    Compact,
    /// Machine-readable JSON format
    Json,
}

impl LoggingConfig {
    /// Create logging configuration from environment variables
    pub fn from_env() -> Self {
        let format = match std::env::var("MF_LOG_FORMAT").as_deref().map(str::trim) {
            Ok("json") => LogFormat::Json,
            _ => LogFormat::Compact,
        };
        let level = std::env::var("MF_LOG_LEVEL")
            .or_else(|_| std::env::var("RUST_LOG"))
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "info".to_string());
        Self { format, level }
    }
}

/// Initialize the global subscriber once; later calls are no-ops.
pub fn init_logging() -> Result<()> {
    if LOGGING_CONFIG.get().is_some() {
        return Ok(());
    }
    let config = LoggingConfig::from_env();
    let filter = EnvFilter::try_new(&config.level).unwrap_or_else(|e| {
        eprintln!("invalid log filter {:?}: {e}; using info", config.level);
        EnvFilter::new("info")
    });

    let layer = match config.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_target(true)
            .with_writer(std::io::stderr)
            .with_filter(filter)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_target(true)
            .with_writer(std::io::stderr)
            .with_filter(filter)
            .boxed(),
    };
    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("logging already initialized: {e}"))?;

    tracing::debug!(format = ?config.format, level = %config.level, "logging initialized");
    let _ = LOGGING_CONFIG.set(config);
    Ok(())
}
