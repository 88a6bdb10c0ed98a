//! Logging configuration and initialization.
//!
//! Every log line carries a `wagate::<area>` target:
//! - `startup`: config loading, session restore, bind address
//! - `api`: HTTP handlers
//! - `registry`: connection lifecycle, reconnects, credential cleanup
//! - `bridge`: bridge socket traffic
//! - `credentials`: credential files on disk
//! - `ws`: event-stream clients
//!
//! Presets pick sensible levels per target; `--log target=level` overrides a
//! single target and `RUST_LOG` replaces the whole filter.

use std::collections::BTreeMap;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

const TARGET_PREFIX: &str = "wagate::";

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => Err(format!("Invalid log format: '{}'. Use 'text' or 'json'.", s)),
        }
    }
}

/// Logging preset levels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogPreset {
    /// Lifecycle events only; bridge and credential chatter hidden.
    #[default]
    Production,
    Verbose,
    Debug,
    /// Everything, including the type of every bridge frame sent or received.
    Trace,
    /// Warnings and errors only.
    Quiet,
}

/// Logging configuration built from CLI arguments.
#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    pub preset: LogPreset,
    /// Per-target level overrides, keyed by full target name.
    pub overrides: BTreeMap<String, Level>,
    pub format: LogFormat,
}

impl LogConfig {
    /// Build from CLI flags. The quietest flag wins, then the noisiest.
    pub fn from_cli(
        verbose: bool,
        debug: bool,
        trace: bool,
        quiet: bool,
        log_overrides: Vec<String>,
        format: LogFormat,
    ) -> Self {
        let preset = if quiet {
            LogPreset::Quiet
        } else if trace {
            LogPreset::Trace
        } else if debug {
            LogPreset::Debug
        } else if verbose {
            LogPreset::Verbose
        } else {
            LogPreset::Production
        };

        let overrides = log_overrides
            .iter()
            .flat_map(|arg| arg.split(','))
            .filter_map(|part| {
                let (target, level) = part.split_once('=')?;
                Some((qualify_target(target.trim()), parse_level(level.trim())?))
            })
            .collect();

        Self {
            preset,
            overrides,
            format,
        }
    }

    /// Filter directives for the preset followed by the overrides.
    pub fn directives(&self) -> Vec<String> {
        let preset: &[&str] = match self.preset {
            LogPreset::Production => &[
                "wagate=info",
                "wagate::bridge=warn",
                "wagate::credentials=warn",
                "tower_http=warn",
            ],
            LogPreset::Verbose => &["wagate=info", "tower_http=info"],
            LogPreset::Debug => &["wagate=debug", "tower_http=debug"],
            LogPreset::Trace => &["wagate=trace", "tower_http=trace"],
            LogPreset::Quiet => &["wagate=warn", "tower_http=error"],
        };

        preset
            .iter()
            .map(|d| d.to_string())
            .chain(
                self.overrides
                    .iter()
                    .map(|(target, level)| format!("{}={}", target, level_to_str(*level))),
            )
            .collect()
    }

    /// Build an EnvFilter, preferring `RUST_LOG` when it is set.
    pub fn build_filter(&self) -> EnvFilter {
        if let Ok(env_filter) = EnvFilter::try_from_default_env() {
            return env_filter;
        }

        EnvFilter::try_new(self.directives().join(",")).unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// `registry` -> `wagate::registry`; full targets and `tower_http` pass through.
fn qualify_target(target: &str) -> String {
    if target.starts_with(TARGET_PREFIX) || target == "wagate" || target.starts_with("tower_http") {
        target.to_string()
    } else {
        format!("{}{}", TARGET_PREFIX, target)
    }
}

fn parse_level(s: &str) -> Option<Level> {
    match s.to_lowercase().as_str() {
        "trace" => Some(Level::TRACE),
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warn" | "warning" => Some(Level::WARN),
        "error" => Some(Level::ERROR),
        _ => None,
    }
}

fn level_to_str(level: Level) -> &'static str {
    match level {
        Level::TRACE => "trace",
        Level::DEBUG => "debug",
        Level::INFO => "info",
        Level::WARN => "warn",
        Level::ERROR => "error",
    }
}

/// Install the global tracing subscriber.
pub fn init(config: &LogConfig) -> anyhow::Result<()> {
    let filter = config.build_filter();

    match config.format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .try_init()?,
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init()?,
    }
    Ok(())
}
