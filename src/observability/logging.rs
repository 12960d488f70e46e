//! tracing subscriber setup for the monitor
//!
//! ## Environment
//!
//! - `LOG_LEVEL`: ERROR, WARN, INFO (default), DEBUG or TRACE; `-v` raises it
//! - `LOG_FORMAT`: `compact` (default), `pretty` or `json`
//! - `LOG_SPANS`: `true` to log span open/close events
//! - `RUST_LOG`: full filter directive, replaces everything above
//!
//! ## Examples
//!
//! ```bash
//! # Terminal use
//! LOG_LEVEL=DEBUG esp32cam-monitor run
//!
//! # Shipping logs to an aggregator
//! LOG_FORMAT=json esp32cam-monitor run
//! ```

use std::env;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Dependencies whose info-level output is mostly noise
const QUIET_DEPENDENCIES: [&str; 4] = ["rumqttc", "rustls", "tokio_rustls", "tokio"];

/// How log lines are rendered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line
    Json,
    /// Multi-line, colored
    Pretty,
    /// Single line, colored
    Compact,
}

impl LogFormat {
    /// Parse log format from string; unknown values fall back to compact
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            "pretty" => LogFormat::Pretty,
            _ => LogFormat::Compact,
        }
    }
}

/// Map a `LOG_LEVEL` value to a level, defaulting to INFO
pub fn parse_level(s: &str) -> Level {
    match s.to_uppercase().as_str() {
        "ERROR" => Level::ERROR,
        "WARN" => Level::WARN,
        "INFO" => Level::INFO,
        "DEBUG" => Level::DEBUG,
        "TRACE" => Level::TRACE,
        _ => Level::INFO,
    }
}

/// Base filter: the requested level for this crate, warn for chatty dependencies
pub fn build_filter(level: Level) -> EnvFilter {
    QUIET_DEPENDENCIES
        .iter()
        .filter_map(|target| format!("{target}=warn").parse().ok())
        .fold(EnvFilter::new(level.to_string()), |filter, directive| {
            filter.add_directive(directive)
        })
}

/// Install the global subscriber
///
/// Does nothing if a global subscriber is already installed.
pub fn init_logging(level: Level, format: LogFormat, include_spans: bool) {
    let filter = match env::var("RUST_LOG") {
        Ok(rust_log) => EnvFilter::new(rust_log),
        Err(_) => build_filter(level),
    };

    let span_events = if include_spans {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let subscriber = tracing_subscriber::registry().with(filter);

    let result = match format {
        LogFormat::Json => subscriber
            .with(fmt::layer().json().with_span_events(span_events))
            .try_init(),
        LogFormat::Pretty => subscriber
            .with(
                fmt::layer()
                    .pretty()
                    .with_ansi(true)
                    .with_span_events(span_events),
            )
            .try_init(),
        LogFormat::Compact => subscriber
            .with(
                fmt::layer()
                    .compact()
                    .with_ansi(true)
                    .with_target(false)
                    .with_span_events(span_events),
            )
            .try_init(),
    };

    if let Err(e) = result {
        eprintln!("Logging already initialized: {e}");
    }
}

/// Install the global subscriber from `LOG_*` variables
pub fn init_default_logging() {
    init_with_verbosity(0);
}

/// Like [`init_default_logging`], with each `-v` raising the level one step
pub fn init_with_verbosity(verbose: u8) {
    let level = env::var("LOG_LEVEL")
        .map(|l| parse_level(&l))
        .unwrap_or(Level::INFO);
    let level = raise_level(level, verbose);

    let format = env::var("LOG_FORMAT")
        .map(|f| LogFormat::parse(&f))
        .unwrap_or(LogFormat::Compact);

    let include_spans = env::var("LOG_SPANS")
        .map(|s| s.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    init_logging(level, format, include_spans);
}

fn raise_level(level: Level, steps: u8) -> Level {
    const ORDER: [Level; 5] = [
        Level::ERROR,
        Level::WARN,
        Level::INFO,
        Level::DEBUG,
        Level::TRACE,
    ];
    let start = ORDER.iter().position(|l| *l == level).unwrap_or(2);
    ORDER[(start + steps as usize).min(ORDER.len() - 1)]
}

/// Create an MQTT session span
#[macro_export]
macro_rules! mqtt_span {
    ($($field:tt)*) => {
        tracing::info_span!("mqtt_session", $($field)*)
    };
}

pub use mqtt_span;
