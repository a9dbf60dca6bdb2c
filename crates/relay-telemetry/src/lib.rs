//! # relay-telemetry
//!
//! Installs the process-wide `tracing` subscriber.

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "relay_transport" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Emit one JSON object per line instead of human-readable output.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: false,
        }
    }
}

impl TelemetryConfig {
    /// Build a config from a textual level such as `"debug"`.
    ///
    /// Unknown levels fall back to `INFO`.
    pub fn from_level_str(level: &str, json: bool) -> Self {
        Self {
            log_level: Level::from_str(level).unwrap_or(Level::INFO),
            module_levels: Vec::new(),
            json,
        }
    }

    /// Directive string handed to `EnvFilter` when `RUST_LOG` is unset.
    pub fn filter_directives(&self) -> String {
        let mut filter_str = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter_str.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter_str
    }
}

/// Initialize the telemetry subsystem. Call once at startup.
///
/// A second call is a no-op, which keeps tests that share a process from panicking.
pub fn init_telemetry(config: TelemetryConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.filter_directives()));

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_filter(env_filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_filter(env_filter)
            .boxed()
    };

    if let Err(e) = tracing_subscriber::registry().with(fmt_layer).try_init() {
        eprintln!("relay-telemetry: subscriber already installed: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_include_module_overrides() {
        let config = TelemetryConfig {
            log_level: Level::WARN,
            module_levels: vec![("relay_dispatch".into(), Level::TRACE)],
            json: true,
        };
        assert_eq!(config.filter_directives(), "warn,relay_dispatch=trace");
    }

    #[test]
    fn unknown_level_falls_back_to_info() {
        assert_eq!(TelemetryConfig::from_level_str("loud", false).log_level, Level::INFO);
        assert_eq!(TelemetryConfig::from_level_str("debug", false).log_level, Level::DEBUG);
    }

    #[test]
    fn double_init_does_not_panic() {
        init_telemetry(TelemetryConfig::default());
        init_telemetry(TelemetryConfig::default());
    }
}
