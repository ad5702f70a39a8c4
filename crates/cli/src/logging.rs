//! Logging bootstrap for the command line tool
//!
//! Logs go to stderr so they never mix with the applied-file listing on
//! stdout.

use clap::ValueEnum;
use std::io;
use tracing_subscriber::{fmt::Layer, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log output format, each backed by a [`LoggingConfig`] preset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    /// Compact single-line text
    #[default]
    Text,
    /// Multi-line output with source locations
    Pretty,
    /// JSON lines for log collectors
    Json,
}

/// Logging configuration for the migration CLI
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "warn")
    pub level: String,
    /// Enable JSON structured logging (vs plain text)
    pub json_format: bool,
    /// Enable pretty printing for development
    pub pretty_print: bool,
    /// Include file and line number information
    pub include_location: bool,
    /// Environment filter (supports filters like "elif_migrate=debug,sqlx=warn")
    pub env_filter: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            json_format: false,
            pretty_print: false,
            include_location: false,
            env_filter: None,
        }
    }
}

impl LoggingConfig {
    /// Machine-readable output for CI and deploy pipelines
    pub fn production() -> Self {
        Self {
            level: "info".to_string(),
            json_format: true,
            pretty_print: false,
            include_location: false,
            env_filter: Some("elif_migrate=info,sqlx=warn".to_string()),
        }
    }

    /// Verbose, human-friendly output
    pub fn development() -> Self {
        Self {
            level: "debug".to_string(),
            json_format: false,
            pretty_print: true,
            include_location: true,
            env_filter: Some("elif_migrate=debug,elif_migrate_cli=debug,sqlx=info".to_string()),
        }
    }

    /// Set the level filter
    pub fn with_level<S: Into<String>>(mut self, level: S) -> Self {
        self.level = level.into();
        self.env_filter = None;
        self
    }

    /// Preset for `format`
    pub fn for_format(format: LogFormat) -> Self {
        match format {
            LogFormat::Text => Self::default(),
            LogFormat::Pretty => Self::development(),
            LogFormat::Json => Self::production(),
        }
    }

    /// The filter directive used when `RUST_LOG` is not set
    fn directive(&self) -> &str {
        self.env_filter.as_deref().unwrap_or(&self.level)
    }
}

/// Initialize logging. `RUST_LOG` takes precedence over the configuration.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(config.directive()))?;

    let layer = Layer::new()
        .with_writer(io::stderr)
        .with_file(config.include_location)
        .with_line_number(config.include_location);

    if config.json_format {
        tracing_subscriber::registry()
            .with(filter)
            .with(layer.json())
            .try_init()?;
    } else if config.pretty_print {
        tracing_subscriber::registry()
            .with(filter)
            .with(layer.pretty())
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(layer)
            .try_init()?;
    }

    tracing::debug!(
        level = %config.directive(),
        json_format = config.json_format,
        "Logging initialized"
    );

    Ok(())
}
