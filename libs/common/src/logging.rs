//! Logging bootstrap for signal services
//!
//! Console and file output share one line format:
//! `2025-12-02T00:50:44.809123Z [INFO] Service started`
//!
//! The file layer is optional and rolls daily through `tracing_appender`
//! (`{dir}/{prefix}.YYYY-MM-DD`). `RUST_LOG` overrides the configured level.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{
    fmt::{
        self,
        format::Writer,
        FmtContext, FormatEvent, FormatFields,
    },
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

const DEFAULT_FILE_PREFIX: &str = "service";

/// Logging section of a service configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directives (e.g. "info" or "info,signal_arbiter=debug")
    #[serde(default = "default_level")]
    pub level: String,

    /// Directory for rolling log files
    #[serde(default = "default_dir")]
    pub dir: PathBuf,

    /// Write a daily-rolling log file in addition to the console
    #[serde(default)]
    pub file_enabled: bool,

    /// Log file name prefix
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_prefix: Option<String>,

    /// Colored console levels
    #[serde(default = "default_ansi")]
    pub ansi: bool,
}

fn default_level() -> String {
    "info".to_string()
}

fn default_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_ansi() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            dir: default_dir(),
            file_enabled: false,
            file_prefix: None,
            ansi: default_ansi(),
        }
    }
}

impl LoggingConfig {
    pub fn file_prefix(&self) -> &str {
        self.file_prefix.as_deref().unwrap_or(DEFAULT_FILE_PREFIX)
    }

    /// Reject filter directives `EnvFilter` cannot parse
    pub fn validate(&self) -> Result<()> {
        config_filter(self).map(|_| ())
    }
}

// ============================================================================
// Formatting
// ============================================================================

fn format_level(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "[TRACE]",
        Level::DEBUG => "[DEBUG]",
        Level::INFO => "[INFO]",
        Level::WARN => "[WARN]",
        Level::ERROR => "[ERROR]",
    }
}

/// `timestamp [LEVEL] message fields`
struct BracketedLevelFormat;

impl<S, N> FormatEvent<S, N> for BracketedLevelFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let now = chrono::Utc::now();
        write!(writer, "{} ", now.format("%Y-%m-%dT%H:%M:%S%.6fZ"))?;

        let level = *event.metadata().level();
        if writer.has_ansi_escapes() {
            let color = match level {
                Level::TRACE => "\x1b[35m",
                Level::DEBUG => "\x1b[34m",
                Level::INFO => "\x1b[32m",
                Level::WARN => "\x1b[33m",
                Level::ERROR => "\x1b[31m",
            };
            write!(writer, "{}{}\x1b[0m ", color, format_level(&level))?;
        } else {
            write!(writer, "{} ", format_level(&level))?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

// ============================================================================
// Initialization
// ============================================================================

fn config_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    EnvFilter::try_new(&config.level)
        .with_context(|| format!("invalid log level directives '{}'", config.level))
}

fn build_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(directives) if !directives.trim().is_empty() => EnvFilter::try_new(&directives)
            .with_context(|| format!("invalid RUST_LOG directives '{}'", directives)),
        _ => config_filter(config),
    }
}

fn file_writer(config: &LoggingConfig) -> Result<Option<(NonBlocking, WorkerGuard)>> {
    if !config.file_enabled {
        return Ok(None);
    }
    fs::create_dir_all(&config.dir)
        .with_context(|| format!("failed to create log directory {:?}", config.dir))?;
    let appender = tracing_appender::rolling::daily(&config.dir, config.file_prefix());
    Ok(Some(tracing_appender::non_blocking(appender)))
}

/// Install the global subscriber
///
/// Returns the file writer's guard when file logging is enabled; keep it
/// alive for the life of the process or buffered lines are lost.
pub fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = build_filter(config)?;

    let console_layer = fmt::layer()
        .with_ansi(config.ansi)
        .event_format(BracketedLevelFormat)
        .boxed();

    let (file_layer, guard) = match file_writer(config)? {
        Some((writer, guard)) => {
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .event_format(BracketedLevelFormat)
                .boxed();
            (Some(layer), Some(guard))
        },
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("global tracing subscriber already installed")?;

    if config.file_enabled {
        tracing::info!(
            "Logging: {} @ {:?} (daily rolling)",
            config.file_prefix(),
            config.dir
        );
    }
    Ok(guard)
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = LoggingConfig::default();
        assert_eq!(config.level, "info");
        assert!(!config.file_enabled);
        assert_eq!(config.file_prefix(), "service");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let config: LoggingConfig =
            serde_yaml::from_str("level: \"info,signal_arbiter=debug\"\nfile_enabled: true\n")
                .unwrap();
        assert!(config.file_enabled);
        assert_eq!(config.dir, PathBuf::from("logs"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_directive_rejected() {
        let config = LoggingConfig {
            level: "signal_arbiter=loud".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_file_writer_disabled() {
        assert!(file_writer(&LoggingConfig::default()).unwrap().is_none());
    }

    #[test]
    fn test_file_writer_creates_rolling_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = LoggingConfig {
            dir: dir.path().join("nested"),
            file_enabled: true,
            file_prefix: Some("signalsrv".to_string()),
            ..Default::default()
        };

        let (mut writer, guard) = file_writer(&config).unwrap().unwrap();
        writer.write_all(b"2024-06-05T12:00:00Z [INFO] hello\n").unwrap();
        drop(writer);
        drop(guard);

        let files: Vec<_> = fs::read_dir(dir.path().join("nested"))
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(files.len(), 1);
        let name = files[0].file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("signalsrv"));
        assert!(fs::read_to_string(&files[0]).unwrap().contains("[INFO] hello"));
    }
}
