//! Trellis Logging Bootstrap
//!
//! Installs the global `tracing` subscriber for the proxy with JSON output
//! by default and configurable pretty-printing for development.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! trellis_log::init();
//! tracing::info!(port = 8080, "listener started");
//! ```
//!
//! # Environment Variables
//!
//! | Variable | Values | Default | Description |
//! |----------|--------|---------|-------------|
//! | `TRELLIS_DEBUG` | `1`, `true` | `false` | Force debug level |
//! | `TRELLIS_LOG_LEVEL` | `trace`..`error`, `off` | `info` | Minimum log level |
//! | `TRELLIS_LOG_FORMAT` | `json`, `pretty`, `compact` | `json` | Output format |
//!
//! # Output Formats
//!
//! ## JSON (default)
//! ```text
//! {"timestamp":"2025-06-20T12:00:00Z","level":"INFO","target":"trellis_core","fields":{"message":"listener started","port":8080}}
//! ```
//!
//! ## Pretty
//! ```text
//! 2025-06-20T12:00:00.123Z  INFO trellis_core: listener started port=8080
//! ```

use std::env;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing_subscriber::EnvFilter;

// Re-export the macros dependents actually use so they only need this crate.
pub use tracing::{debug, error, info, trace, warn};

// ============================================================================
// Log Levels
// ============================================================================

/// Minimum log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    /// Trace level (most verbose)
    Trace,
    /// Debug level
    Debug,
    /// Info level
    Info,
    /// Warning level
    Warn,
    /// Error level (least verbose)
    Error,
    /// Off (no logging)
    Off,
}

impl Level {
    /// Parse a level from its string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "trace" => Some(Level::Trace),
            "debug" => Some(Level::Debug),
            "info" => Some(Level::Info),
            "warn" | "warning" => Some(Level::Warn),
            "error" => Some(Level::Error),
            "off" | "none" => Some(Level::Off),
            _ => None,
        }
    }

    /// Level name as used in filter directives.
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Off => "off",
        }
    }
}

// ============================================================================
// Output Format
// ============================================================================

/// Subscriber output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    /// One JSON object per event (production default)
    #[default]
    Json,
    /// Human-readable multi-field output
    Pretty,
    /// Single-line terse output
    Compact,
}

impl Format {
    /// Parse a format from its string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "json" => Some(Format::Json),
            "pretty" => Some(Format::Pretty),
            "compact" => Some(Format::Compact),
            _ => None,
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Builder for the global subscriber.
#[derive(Debug, Clone, Default)]
pub struct Config {
    level: Option<Level>,
    format: Option<Format>,
}

impl Config {
    /// Set the minimum level, overriding the environment.
    pub fn level(mut self, level: Level) -> Self {
        self.level = Some(level);
        self
    }

    /// Set the output format, overriding the environment.
    pub fn format(mut self, format: Format) -> Self {
        self.format = Some(format);
        self
    }

    /// Install the global subscriber. Later calls are no-ops.
    pub fn apply(self) {
        if INSTALLED.swap(true, Ordering::SeqCst) {
            return;
        }

        let level = self.level.or_else(level_from_env).unwrap_or(Level::Info);
        let format = self.format.or_else(format_from_env).unwrap_or_default();

        let filter = EnvFilter::try_from_env("TRELLIS_LOG_FILTER")
            .unwrap_or_else(|_| EnvFilter::new(level.as_str()));

        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true);

        // try_init: a subscriber installed by a test harness wins.
        let result = match format {
            Format::Json => builder.json().flatten_event(true).try_init(),
            Format::Pretty => builder.pretty().try_init(),
            Format::Compact => builder.compact().try_init(),
        };
        let _ = result;
    }
}

fn level_from_env() -> Option<Level> {
    if matches!(
        env::var("TRELLIS_DEBUG").ok().as_deref(),
        Some("1") | Some("true")
    ) {
        return Some(Level::Debug);
    }
    env::var("TRELLIS_LOG_LEVEL").ok().and_then(|v| Level::parse(&v))
}

fn format_from_env() -> Option<Format> {
    env::var("TRELLIS_LOG_FORMAT").ok().and_then(|v| Format::parse(&v))
}

/// Start configuring the subscriber.
pub fn configure() -> Config {
    Config::default()
}

/// Install the subscriber with environment-driven defaults.
pub fn init() {
    configure().apply();
}

/// Pretty + debug preset for local development.
pub fn preset_development() {
    configure().format(Format::Pretty).level(Level::Debug).apply();
}

/// JSON + info preset for production.
pub fn preset_production() {
    configure().format(Format::Json).level(Level::Info).apply();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_parse() {
        assert_eq!(Level::parse("info"), Some(Level::Info));
        assert_eq!(Level::parse("WARN"), Some(Level::Warn));
        assert_eq!(Level::parse("warning"), Some(Level::Warn));
        assert_eq!(Level::parse("none"), Some(Level::Off));
        assert_eq!(Level::parse("loud"), None);
    }

    #[test]
    fn test_format_parse() {
        assert_eq!(Format::parse("json"), Some(Format::Json));
        assert_eq!(Format::parse("Pretty"), Some(Format::Pretty));
        assert_eq!(Format::parse("xml"), None);
    }

    #[test]
    fn test_level_ordering() {
        assert!(Level::Trace < Level::Debug);
        assert!(Level::Error < Level::Off);
    }

    #[test]
    fn test_apply_is_idempotent() {
        init();
        init();
        preset_production();
    }
}
