//! # WDM Telemetry
//!
//! Logging and metrics shared by the Weave Data Management subsystems.
//!
//! ## Components
//!
//! - **Logging**: `tracing-subscriber` registry with `EnvFilter` and pretty
//!   or JSON output, plus `log_*_event!` macros for consistent fields
//! - **Metrics**: Prometheus counters, gauges and histograms
//!
//! ## Usage
//!
//! ```rust,ignore
//! use wdm_telemetry::{init_telemetry, TelemetryConfig};
//!
//! let config = TelemetryConfig::from_env();
//! init_telemetry(&config).expect("Failed to init telemetry");
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `WDM_SERVICE_NAME` | `wdm` | Service name in logs |
//! | `WDM_LOG_LEVEL` / `RUST_LOG` | `info` | Log filter |
//! | `WDM_JSON_LOGS` | `false` | JSON log output |
//! | `WDM_METRICS_PORT` | `9100` | Metrics port for embedders |

#![warn(missing_docs)]

mod config;
mod logging;
pub mod metrics;

pub use config::TelemetryConfig;
pub use logging::init_logging;
pub use metrics::{
    encode_metrics, register_metrics, CATALOG_INSTANCES, DIRTY_SET_OVERFLOWS, EXCHANGE_RETRIES,
    NOTIFIES_APPLIED, SUBSCRIBE_DURATION, SUBSCRIPTIONS_ESTABLISHED, SUBSCRIPTION_ABORTS,
    SUBSYSTEM_ERRORS, UPDATES_SENT, UPDATE_CONFLICTS,
};

use thiserror::Error;

/// Telemetry initialization errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    /// Global subscriber could not be installed.
    #[error("Failed to initialize logging: {0}")]
    LoggingInit(String),

    /// Metric registration or encoding failed.
    #[error("Failed to initialize Prometheus metrics: {0}")]
    MetricsInit(String),

    /// Configuration value is invalid.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Initialize logging and register metrics.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    register_metrics()?;
    init_logging(config)
}

/// Convenience macro for recording a metric increment.
#[macro_export]
macro_rules! metric_inc {
    ($metric:expr) => {
        $metric.inc()
    };
    ($metric:expr, $labels:expr) => {
        $metric.with_label_values($labels).inc()
    };
}
