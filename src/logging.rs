//! Tracing Infrastructure
//!
//! Structured, async-aware logging for the acquisition core, built on `tracing` and
//! `tracing-subscriber`:
//! - Multiple output formats (pretty, compact, JSON)
//! - Environment-based filtering (`RUST_LOG` overrides the configured level)
//! - An [`AlertLayer`] that forwards error-flagged events to the presentation layer
//!
//! Every instrument exchange is logged as a `<<` request / `>>` response pair at debug
//! level by [`crate::hardware::protocol`]. Any event at `ERROR` level, or whose message
//! contains the word "error", is additionally turned into an [`Alert`] so the front end
//! can ask the operator for an acknowledgment.
//!
//! # Example
//! ```no_run
//! use cpl_daq::{config::CplConfig, logging};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CplConfig::load()?;
//! let (sink, mut alerts) = logging::alert_channel();
//! let tracing_config = logging::TracingConfig::from_config(&config)?
//!     .with_format(logging::OutputFormat::Json);
//! logging::init(tracing_config, Some(sink))?;
//! tracing::error!("lock-in poll error");
//! assert!(alerts.try_recv().is_ok());
//! # Ok(())
//! # }
//! ```

use crate::config::CplConfig;
use chrono::{DateTime, Local};
use std::fmt;
use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::{
    fmt::{self as tfmt, format::FmtSpan},
    layer::{Context, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Output format for tracing
#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    /// Pretty-printed format with colors (for development)
    Pretty,
    /// Compact format without colors (for production)
    Compact,
    /// JSON format for structured logging (for log aggregation)
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(OutputFormat::Pretty),
            "compact" => Ok(OutputFormat::Compact),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!(
                "Invalid log format '{}'. Must be one of: pretty, compact, json",
                s
            )),
        }
    }
}

/// Tracing configuration options
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: Level,
    /// Output format
    pub format: OutputFormat,
    /// Whether to include span events (NEW, CLOSE)
    pub with_span_events: bool,
    /// Whether to include file and line numbers
    pub with_file_and_line: bool,
    /// Whether to include thread names
    pub with_thread_names: bool,
    /// Whether to enable ANSI colors (only for Pretty format)
    pub with_ansi: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Compact,
            with_span_events: false,
            with_file_and_line: false,
            with_thread_names: true,
            with_ansi: true,
        }
    }
}

impl TracingConfig {
    /// Create tracing config from the application configuration
    pub fn from_config(config: &CplConfig) -> Result<Self, String> {
        let level = parse_log_level(&config.application.log_level)?;

        Ok(Self {
            level,
            ..Default::default()
        })
    }

    /// Set output format
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Enable or disable span events
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }

    /// Enable or disable ANSI colors
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }
}

/// A log line the operator has to acknowledge.
#[derive(Debug, Clone)]
pub struct Alert {
    pub timestamp: DateTime<Local>,
    pub level: Level,
    pub target: String,
    pub message: String,
}

/// Sending half of the alert channel, owned by the [`AlertLayer`].
pub type AlertSink = mpsc::UnboundedSender<Alert>;

/// Create the alert channel. The receiver is drained by the presentation layer.
pub fn alert_channel() -> (AlertSink, mpsc::UnboundedReceiver<Alert>) {
    mpsc::unbounded_channel()
}

/// Layer that turns error-flagged events into [`Alert`]s.
pub struct AlertLayer {
    sink: AlertSink,
}

impl AlertLayer {
    pub fn new(sink: AlertSink) -> Self {
        Self { sink }
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: Vec<String>,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push(format!("{}={}", field.name(), value));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            self.fields.push(format!("{}={:?}", field.name(), value));
        }
    }
}

impl MessageVisitor {
    fn render(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else {
            format!("{} {}", self.message, self.fields.join(" "))
        }
    }
}

/// Whether a log line counts as textually flagged as an error.
pub fn is_error_flagged(level: &Level, message: &str) -> bool {
    *level == Level::ERROR || message.to_lowercase().contains("error")
}

impl<S> Layer<S> for AlertLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let message = visitor.render();

        if is_error_flagged(metadata.level(), &message) {
            // A closed receiver only means nobody is listening any more.
            let _ = self.sink.send(Alert {
                timestamp: Local::now(),
                level: *metadata.level(),
                target: metadata.target().to_string(),
                message,
            });
        }
    }
}

/// Initialize tracing with custom configuration
///
/// This function is idempotent - if tracing is already initialized, it will
/// return Ok(()) without error. This makes it safe to call in tests and libraries.
pub fn init(config: TracingConfig, alerts: Option<AlertSink>) -> Result<(), String> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_to_filter_string(config.level)));

    let span_events = if config.with_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let fmt_layer = match config.format {
        OutputFormat::Pretty => tfmt::layer()
            .pretty()
            .with_span_events(span_events)
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_thread_names(config.with_thread_names)
            .with_ansi(config.with_ansi)
            .boxed(),
        OutputFormat::Compact => tfmt::layer()
            .compact()
            .with_span_events(span_events)
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_thread_names(config.with_thread_names)
            .with_ansi(false)
            .boxed(),
        OutputFormat::Json => tfmt::layer()
            .json()
            .with_span_events(span_events)
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_thread_names(config.with_thread_names)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(alerts.map(AlertLayer::new))
        .try_init()
        .or_else(|e| {
            // Already initialized is expected in tests and when several
            // components try to init tracing.
            if e
                .to_string()
                .contains("a global default trace dispatcher has already been set")
            {
                Ok(())
            } else {
                Err(format!("Failed to initialize tracing: {}", e))
            }
        })
}

/// Parse log level string into tracing Level
pub fn parse_log_level(level: &str) -> Result<Level, String> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(format!(
            "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
            level
        )),
    }
}

fn level_to_filter_string(level: Level) -> String {
    match level {
        Level::TRACE => "trace".to_string(),
        Level::DEBUG => "debug".to_string(),
        Level::INFO => "info".to_string(),
        Level::WARN => "warn".to_string(),
        Level::ERROR => "error".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert!(matches!(parse_log_level("trace"), Ok(Level::TRACE)));
        assert!(matches!(parse_log_level("warn"), Ok(Level::WARN)));

        // Case insensitive
        assert!(matches!(parse_log_level("INFO"), Ok(Level::INFO)));
        assert!(matches!(parse_log_level("Debug"), Ok(Level::DEBUG)));

        assert!(parse_log_level("invalid").is_err());
    }

    #[test]
    fn test_tracing_config_from_config() {
        let mut config = CplConfig::default();
        config.application.log_level = "debug".to_string();
        let tracing_config = TracingConfig::from_config(&config).unwrap();
        assert!(matches!(tracing_config.level, Level::DEBUG));
    }

    #[test]
    fn test_tracing_config_builder() {
        let mut app_config = CplConfig::default();
        app_config.application.log_level = "warn".to_string();
        let config = TracingConfig::from_config(&app_config)
            .unwrap()
            .with_format("JSON".parse().unwrap())
            .with_span_events(true)
            .with_ansi(false);

        assert!(matches!(config.level, Level::WARN));
        assert!(matches!(config.format, OutputFormat::Json));
        assert!(config.with_span_events);
        assert!(!config.with_ansi);
    }

    #[test]
    fn unknown_output_format_is_rejected() {
        assert!(matches!("pretty".parse(), Ok(OutputFormat::Pretty)));
        assert!("xml".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn alert_layer_forwards_error_flagged_events() {
        let (sink, mut rx) = alert_channel();
        let subscriber = tracing_subscriber::registry().with(AlertLayer::new(sink));

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("moved to 500 nm");
            tracing::warn!(device = "PEM", "communication error on :MOD:AMP");
            tracing::error!("scan aborted");
        });

        let first = rx.try_recv().unwrap();
        assert_eq!(first.level, Level::WARN);
        assert!(first.message.contains("communication error"));
        assert!(first.message.contains("device=PEM"));

        let second = rx.try_recv().unwrap();
        assert_eq!(second.level, Level::ERROR);
        assert_eq!(second.message, "scan aborted");

        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn error_marker_is_case_insensitive() {
        assert!(is_error_flagged(&Level::INFO, "ERROR: PMT overexposed"));
        assert!(!is_error_flagged(&Level::WARN, "range saturated"));
        assert!(is_error_flagged(&Level::ERROR, "anything"));
    }
}
