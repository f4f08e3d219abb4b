//! Telemetry configuration from environment variables.

use serde::{Deserialize, Serialize};
use std::env;

/// Configuration for logging and metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Service name attached to every log line
    pub service_name: String,

    /// Log level filter (trace, debug, info, warn, error) or an
    /// `EnvFilter` directive string
    pub log_level: String,

    /// Whether to emit JSON formatted logs
    pub json_logs: bool,

    /// Whether to include the target module in log lines
    pub with_target: bool,

    /// Port an embedder should expose `encode_metrics()` on
    pub metrics_port: u16,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "wdm".to_string(),
            log_level: "info".to_string(),
            json_logs: false,
            with_target: true,
            metrics_port: 9100,
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `WDM_SERVICE_NAME`: Service name (default: wdm)
    /// - `WDM_LOG_LEVEL` or `RUST_LOG`: Log filter (default: info)
    /// - `WDM_JSON_LOGS`: Enable JSON logs (default: false)
    /// - `WDM_METRICS_PORT`: Prometheus metrics port (default: 9100)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            service_name: env::var("WDM_SERVICE_NAME").unwrap_or(defaults.service_name),

            log_level: env::var("WDM_LOG_LEVEL")
                .or_else(|_| env::var("RUST_LOG"))
                .unwrap_or(defaults.log_level),

            json_logs: env::var("WDM_JSON_LOGS")
                .map(|v| parse_flag(&v))
                .unwrap_or(defaults.json_logs),

            with_target: defaults.with_target,

            metrics_port: env::var("WDM_METRICS_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.metrics_port),
        }
    }

    /// Quiet configuration for tests: warnings only, plain text.
    pub fn for_testing() -> Self {
        Self {
            service_name: "wdm-test".to_string(),
            log_level: "warn".to_string(),
            json_logs: false,
            with_target: false,
            metrics_port: 0,
        }
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}
