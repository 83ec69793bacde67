//! Logging setup shared by the supervisor and its workers.
//!
//! Workers inherit the supervisor's environment, so the same configuration
//! applies to every process in the pool. All output goes to stderr: a
//! worker's stdout is its control channel to the supervisor.
//!
//! # Environment Variables
//!
//! - `ROTA_LOG` - Log filter (overrides RUST_LOG)
//! - `ROTA_LOG_LEVEL` - Log level: error, warn, info, debug, trace
//! - `ROTA_LOG_FORMAT` - Output format: pretty, compact, json
//! - `ROTA_LOG_FILE` - Path to log file (in addition to stderr)
//! - `RUST_LOG` - Standard Rust log filter (fallback)
//!
//! # Example
//!
//! ```no_run
//! use worker_rota::logging::{LogConfig, init};
//!
//! init(LogConfig::default().with_env_overrides());
//! ```

use std::path::PathBuf;
use std::str::FromStr;

use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    fmt::{self, MakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable multi-field format
    #[default]
    Pretty,
    /// Compact single-line format
    Compact,
    /// JSON format for log aggregation systems
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "full" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(format!(
                "Unknown log format: '{}'. Valid options: pretty, compact, json",
                s
            )),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Compact => write!(f, "compact"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Rotation policy for the optional log file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogRotation {
    Hourly,
    #[default]
    Daily,
    Never,
}

impl FromStr for LogRotation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hourly" => Ok(Self::Hourly),
            "daily" => Ok(Self::Daily),
            "never" => Ok(Self::Never),
            _ => Err(format!(
                "Unknown log rotation: '{}'. Valid options: hourly, daily, never",
                s
            )),
        }
    }
}

impl From<LogRotation> for Rotation {
    fn from(rotation: LogRotation) -> Self {
        match rotation {
            LogRotation::Hourly => Rotation::HOURLY,
            LogRotation::Daily => Rotation::DAILY,
            LogRotation::Never => Rotation::NEVER,
        }
    }
}

/// Logging configuration.
///
/// Use the builder methods to customize, then pass to [`init`].
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Base log level (default: INFO)
    pub level: Level,
    /// Log format (default: Pretty)
    pub format: LogFormat,
    /// Custom filter string (overrides level if set)
    pub filter: Option<String>,
    /// Path to an additional log file (None = stderr only)
    pub file_path: Option<PathBuf>,
    /// Rotation for file output (default: Daily)
    pub rotation: LogRotation,
    /// Show target module in logs (default: true)
    pub show_target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            filter: None,
            file_path: None,
            rotation: LogRotation::Daily,
            show_target: true,
        }
    }
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn with_file(mut self, path: PathBuf) -> Self {
        self.file_path = Some(path);
        self
    }

    pub fn with_rotation(mut self, rotation: LogRotation) -> Self {
        self.rotation = rotation;
        self
    }

    /// Apply environment variable overrides.
    ///
    /// A filter that was already set explicitly is kept; `ROTA_LOG` and
    /// `RUST_LOG` only fill it in when absent.
    pub fn with_env_overrides(self) -> Self {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup.
    fn apply_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if self.filter.is_none() {
            self.filter = lookup("ROTA_LOG").or_else(|| lookup("RUST_LOG"));
        }

        if self.filter.is_none()
            && let Some(level) = lookup("ROTA_LOG_LEVEL").as_deref().and_then(parse_level)
        {
            self.level = level;
        }

        if let Some(format) = lookup("ROTA_LOG_FORMAT")
            && let Ok(format) = format.parse()
        {
            self.format = format;
        }

        if let Some(path) = lookup("ROTA_LOG_FILE") {
            self.file_path = Some(PathBuf::from(path));
        }

        if let Some(rotation) = lookup("ROTA_LOG_ROTATION") {
            match rotation.parse() {
                Ok(rotation) => self = self.with_rotation(rotation),
                Err(e) => eprintln!("Warning: {}", e),
            }
        }

        self
    }

    fn build_filter(&self) -> EnvFilter {
        let fallback = || EnvFilter::new(self.level.to_string().to_lowercase());
        match self.filter {
            Some(ref filter) => EnvFilter::try_new(filter).unwrap_or_else(|_| {
                eprintln!("Warning: Invalid log filter '{}', using default", filter);
                fallback()
            }),
            None => fallback(),
        }
    }
}

/// Parse a log level string.
fn parse_level(s: &str) -> Option<Level> {
    match s.to_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

fn format_layer<W>(config: &LogConfig, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_target(config.show_target)
        .with_ansi(ansi)
        .with_writer(writer);

    match config.format {
        LogFormat::Json => layer.json().boxed(),
        LogFormat::Compact => layer.compact().boxed(),
        LogFormat::Pretty => layer.boxed(),
    }
}

/// Initialize the global tracing subscriber.
///
/// Logs to stderr, and additionally to a rolling file when
/// `config.file_path` is set. Subsequent calls are silently ignored.
pub fn init(config: LogConfig) {
    let filter = config.build_filter();

    let mut layers = vec![format_layer(&config, std::io::stderr, true)];

    if let Some(path) = config.file_path.as_ref() {
        let parent = path.parent().unwrap_or(std::path::Path::new("."));
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("worker-rota.log");
        let appender = RollingFileAppender::new(config.rotation.into(), parent, file_name);
        layers.push(format_layer(&config, appender, false));
    }

    // Already initialized is fine: the host may have installed its own subscriber.
    let _ = tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_log_format_from_str() {
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("full".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("compact".parse::<LogFormat>().unwrap(), LogFormat::Compact);
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_log_rotation_from_str() {
        assert_eq!(
            "hourly".parse::<LogRotation>().unwrap(),
            LogRotation::Hourly
        );
        assert_eq!("never".parse::<LogRotation>().unwrap(), LogRotation::Never);
        assert!("weekly".parse::<LogRotation>().is_err());
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("warning"), Some(Level::WARN));
        assert_eq!(parse_level("DEBUG"), Some(Level::DEBUG));
        assert_eq!(parse_level("loud"), None);
    }

    #[test]
    fn test_rota_log_takes_precedence_over_rust_log() {
        let config = LogConfig::default().apply_overrides(lookup(&[
            ("ROTA_LOG", "worker_rota=debug"),
            ("RUST_LOG", "warn"),
        ]));
        assert_eq!(config.filter.as_deref(), Some("worker_rota=debug"));
    }

    #[test]
    fn test_explicit_filter_wins_over_env() {
        let config = LogConfig::default()
            .with_filter("trace")
            .apply_overrides(lookup(&[("ROTA_LOG", "error")]));
        assert_eq!(config.filter.as_deref(), Some("trace"));
    }

    #[test]
    fn test_level_and_format_overrides() {
        let config = LogConfig::default().apply_overrides(lookup(&[
            ("ROTA_LOG_LEVEL", "debug"),
            ("ROTA_LOG_FORMAT", "json"),
            ("ROTA_LOG_FILE", "/tmp/rota.log"),
        ]));
        assert_eq!(config.level, Level::DEBUG);
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.file_path, Some(PathBuf::from("/tmp/rota.log")));
    }

    #[test]
    fn test_rotation_override() {
        let config = LogConfig::default().apply_overrides(lookup(&[("ROTA_LOG_ROTATION", "hourly")]));
        assert_eq!(config.rotation, LogRotation::Hourly);

        let config = LogConfig::default().apply_overrides(lookup(&[("ROTA_LOG_ROTATION", "weekly")]));
        assert_eq!(config.rotation, LogRotation::Daily);
    }

    #[test]
    fn test_invalid_format_override_is_ignored() {
        let config =
            LogConfig::default().apply_overrides(lookup(&[("ROTA_LOG_FORMAT", "yaml")]));
        assert_eq!(config.format, LogFormat::Pretty);
    }

    #[test]
    fn test_init_is_idempotent() {
        init(LogConfig::default().with_level(Level::WARN));
        init(LogConfig::default().with_format(LogFormat::Json));
    }
}
