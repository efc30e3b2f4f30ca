//! Logging setup shared by every prewarm process.
//!
//! The pool, its supervisors and workers all inherit the terminal's stderr, so
//! the default level is WARN: a warm pool must stay silent unless something is
//! wrong. Forked processes inherit the subscriber installed before the fork.
//!
//! # Environment Variables
//!
//! - `PREWARM_LOG` - Log filter (overrides RUST_LOG)
//! - `PREWARM_LOG_LEVEL` - Log level: error, warn, info, debug, trace
//! - `PREWARM_LOG_FORMAT` - Output format: pretty, compact, json
//! - `PREWARM_LOG_FILE` - Path to log file (in addition to stderr)
//! - `RUST_LOG` - Standard Rust log filter (fallback)
//!
//! # Example
//!
//! ```no_run
//! use prewarm::logging::{LogConfig, init};
//!
//! init(LogConfig::for_pool().with_env_overrides());
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    fmt::{self, format::FmtSpan},
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

/// Logging configuration.
///
/// Use the builder methods to customize, then pass to [`init`].
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Base log level (default: WARN)
    pub level: Level,
    /// Log format (default: Pretty)
    pub format: LogFormat,
    /// Path to log file (None = stderr only)
    pub file_path: Option<PathBuf>,
    /// Custom filter string (overrides level if set)
    pub filter: Option<String>,
    /// Show target module in logs (default: true)
    pub show_target: bool,
    /// Log span timing on close (default: false)
    pub span_events: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::WARN,
            format: LogFormat::Pretty,
            file_path: None,
            filter: None,
            show_target: true,
            span_events: false,
        }
    }
}

impl LogConfig {
    /// Create a new LogConfig with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Preset for `prewarm serve`: the dispatcher and every slot process.
    pub fn for_pool() -> Self {
        Self::default()
    }

    /// Preset for `prewarm run`. Clients are short-lived, so the target is
    /// dropped to keep lines short.
    pub fn for_client() -> Self {
        Self {
            show_target: false,
            ..Self::default()
        }
    }

    /// Raise the level from the `-v` count (0 keeps the preset level).
    /// At trace level slot spans also report when they close.
    pub fn with_verbosity(mut self, count: u8) -> Self {
        self.level = match count {
            0 => self.level,
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        };
        if count >= 3 {
            self.span_events = true;
        }
        self
    }

    /// Log span timing on close.
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.span_events = enabled;
        self
    }

    /// Set the log level.
    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    /// Set the log format.
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Set the log file path.
    pub fn with_file(mut self, path: PathBuf) -> Self {
        self.file_path = Some(path);
        self
    }

    /// Set a custom filter string.
    pub fn with_filter(mut self, filter: String) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Apply environment variable overrides.
    ///
    /// CLI arguments take precedence: if a filter is already set, `PREWARM_LOG`,
    /// `RUST_LOG` and `PREWARM_LOG_LEVEL` are ignored.
    pub fn with_env_overrides(mut self) -> Self {
        if self.filter.is_none() {
            if let Ok(filter) = std::env::var("PREWARM_LOG") {
                self.filter = Some(filter);
            } else if let Ok(filter) = std::env::var("RUST_LOG") {
                self.filter = Some(filter);
            }
        }

        if self.filter.is_none()
            && let Ok(level_str) = std::env::var("PREWARM_LOG_LEVEL")
        {
            self.level = parse_level(&level_str).unwrap_or(self.level);
        }

        if let Ok(format) = std::env::var("PREWARM_LOG_FORMAT")
            && let Ok(f) = format.parse()
        {
            self.format = f;
        }

        if let Ok(path) = std::env::var("PREWARM_LOG_FILE") {
            self.file_path = Some(PathBuf::from(path));
        }

        self
    }

    /// Build the EnvFilter for this configuration.
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

    fn span_events(&self) -> FmtSpan {
        if self.span_events {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    }

    /// Build one formatting layer for the given writer.
    fn layer<W>(&self, writer: W, ansi: bool) -> Box<dyn Layer<Registry> + Send + Sync>
    where
        W: for<'w> fmt::MakeWriter<'w> + Send + Sync + 'static,
    {
        let base = fmt::layer()
            .with_span_events(self.span_events())
            .with_target(self.show_target)
            .with_ansi(ansi)
            .with_writer(writer);

        match self.format {
            LogFormat::Json => base.json().boxed(),
            LogFormat::Compact => base.compact().boxed(),
            LogFormat::Pretty => base.boxed(),
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

/// File appender that never rotates. Writes happen on the calling thread;
/// the pool forks after logging is set up, and a background writer thread
/// would not survive the fork.
fn file_appender(path: &Path) -> RollingFileAppender {
    let parent = path.parent().unwrap_or(Path::new("."));
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("prewarm.log");
    RollingFileAppender::new(Rotation::NEVER, parent, file_name)
}

/// Initialize the global tracing subscriber.
///
/// Logs go to stderr, and additionally to `config.file_path` when set.
/// Subsequent calls are silently ignored.
pub fn init(config: LogConfig) {
    let mut layers = vec![config.layer(std::io::stderr, true)];
    if let Some(ref path) = config.file_path {
        layers.push(config.layer(file_appender(path), false));
    }

    let result = tracing_subscriber::registry()
        .with(layers)
        .with(config.build_filter())
        .try_init();

    // Silently ignore if already initialized (idempotent)
    let _ = result;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_from_str() {
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("full".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("compact".parse::<LogFormat>().unwrap(), LogFormat::Compact);
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("error"), Some(Level::ERROR));
        assert_eq!(parse_level("warning"), Some(Level::WARN));
        assert_eq!(parse_level("INFO"), Some(Level::INFO));
        assert_eq!(parse_level("trace"), Some(Level::TRACE));
        assert_eq!(parse_level("loud"), None);
    }

    #[test]
    fn test_pool_defaults_are_quiet() {
        let config = LogConfig::for_pool();
        assert_eq!(config.level, Level::WARN);
        assert_eq!(config.format, LogFormat::Pretty);
        assert!(config.file_path.is_none());
        assert!(config.show_target);
    }

    #[test]
    fn test_client_preset_hides_target() {
        assert!(!LogConfig::for_client().show_target);
    }

    #[test]
    fn test_verbosity_levels() {
        assert_eq!(LogConfig::new().with_verbosity(0).level, Level::WARN);
        assert_eq!(LogConfig::new().with_verbosity(1).level, Level::INFO);
        assert_eq!(LogConfig::new().with_verbosity(2).level, Level::DEBUG);
        assert_eq!(LogConfig::new().with_verbosity(7).level, Level::TRACE);
    }

    #[test]
    fn test_span_events_follow_trace_verbosity() {
        assert!(!LogConfig::new().with_verbosity(2).span_events);
        let trace = LogConfig::new().with_verbosity(3);
        assert!(trace.span_events);
        assert_eq!(trace.span_events(), FmtSpan::CLOSE);
        assert_eq!(
            LogConfig::new().with_span_events(false).span_events(),
            FmtSpan::NONE
        );
    }

    #[test]
    fn test_log_config_builder() {
        let config = LogConfig::new()
            .with_level(Level::DEBUG)
            .with_format(LogFormat::Json)
            .with_filter("prewarm=trace".to_string())
            .with_file(PathBuf::from("/tmp/prewarm-test.log"));

        assert_eq!(config.level, Level::DEBUG);
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.filter.as_deref(), Some("prewarm=trace"));
        assert_eq!(config.file_path, Some(PathBuf::from("/tmp/prewarm-test.log")));
    }
}
