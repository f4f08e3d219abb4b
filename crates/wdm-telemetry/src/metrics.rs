//! Prometheus metrics for the WDM subsystems.
//!
//! All metrics follow the naming convention: `wdm_<area>_<metric>_<unit>`
//!
//! Metrics are process-wide statics. Incrementing them never requires
//! registration; `register_metrics` only exposes them through `REGISTRY`.

use lazy_static::lazy_static;
use prometheus::{
    exponential_buckets, Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts,
    Registry, TextEncoder,
};

use crate::TelemetryError;

lazy_static! {
    /// Global metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // =========================================================================
    // CATALOG METRICS (Subsystem 3)
    // =========================================================================

    /// Trait instances currently registered
    pub static ref CATALOG_INSTANCES: Gauge = Gauge::new(
        "wdm_catalog_instances",
        "Number of trait instances registered in the catalog"
    ).expect("metric creation failed");

    // =========================================================================
    // BATCHING METRICS (Subsystem 4)
    // =========================================================================

    /// Dirty sets collapsed to the whole trait
    pub static ref DIRTY_SET_OVERFLOWS: Counter = Counter::new(
        "wdm_batching_dirty_overflows_total",
        "Dirty sets that exceeded their path budget and collapsed to the root"
    ).expect("metric creation failed");

    // =========================================================================
    // SUBSCRIPTION METRICS (Subsystem 5)
    // =========================================================================

    /// Subscriptions that reached Established
    pub static ref SUBSCRIPTIONS_ESTABLISHED: Counter = Counter::new(
        "wdm_subscriptions_established_total",
        "Subscriptions that completed their initial exchange"
    ).expect("metric creation failed");

    /// Notifies applied to sinks
    pub static ref NOTIFIES_APPLIED: CounterVec = CounterVec::new(
        Opts::new("wdm_notifies_applied_total", "Notifies applied to local sinks"),
        &["kind"]  // kind: full/diff
    ).expect("metric creation failed");

    /// Update requests sent
    pub static ref UPDATES_SENT: Counter = Counter::new(
        "wdm_updates_sent_total",
        "Update requests handed to the transport"
    ).expect("metric creation failed");

    /// Update requests rejected for a stale base version
    pub static ref UPDATE_CONFLICTS: Counter = Counter::new(
        "wdm_update_conflicts_total",
        "Update requests answered with a version conflict"
    ).expect("metric creation failed");

    /// Exchange-level retransmissions
    pub static ref EXCHANGE_RETRIES: Counter = Counter::new(
        "wdm_exchange_retries_total",
        "Requests resent after an exchange timeout"
    ).expect("metric creation failed");

    /// Subscriptions that entered Aborting
    pub static ref SUBSCRIPTION_ABORTS: CounterVec = CounterVec::new(
        Opts::new("wdm_subscription_aborts_total", "Subscriptions that entered Aborting"),
        &["error_class"]  // error_class: transport/conflict/schema/catalog/fatal
    ).expect("metric creation failed");

    /// Subscribe exchange duration
    pub static ref SUBSCRIBE_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "wdm_subscribe_duration_seconds",
            "Time from SubscribeRequest to Established"
        ).buckets(exponential_buckets(0.001, 2.0, 14).expect("valid buckets"))
    ).expect("metric creation failed");

    // =========================================================================
    // ERROR METRICS
    // =========================================================================

    /// Subsystem errors by type
    pub static ref SUBSYSTEM_ERRORS: CounterVec = CounterVec::new(
        Opts::new("wdm_subsystem_errors_total", "Errors by subsystem and type"),
        &["subsystem", "error_type"]
    ).expect("metric creation failed");
}

/// Register all metrics with the global registry.
pub fn register_metrics() -> Result<(), TelemetryError> {
    let metrics: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(CATALOG_INSTANCES.clone()),
        Box::new(DIRTY_SET_OVERFLOWS.clone()),
        Box::new(SUBSCRIPTIONS_ESTABLISHED.clone()),
        Box::new(NOTIFIES_APPLIED.clone()),
        Box::new(UPDATES_SENT.clone()),
        Box::new(UPDATE_CONFLICTS.clone()),
        Box::new(EXCHANGE_RETRIES.clone()),
        Box::new(SUBSCRIPTION_ABORTS.clone()),
        Box::new(SUBSCRIBE_DURATION.clone()),
        Box::new(SUBSYSTEM_ERRORS.clone()),
    ];

    for metric in metrics {
        REGISTRY
            .register(metric)
            .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    }
    Ok(())
}

/// Encode all metrics as Prometheus text format.
pub fn encode_metrics() -> Result<String, TelemetryError> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| TelemetryError::MetricsInit(e.to_string()))
}

/// Timer guard for automatic histogram observation.
pub struct HistogramTimer {
    histogram: Histogram,
    start: std::time::Instant,
}

impl HistogramTimer {
    /// Start a new timer for the given histogram.
    pub fn new(histogram: &Histogram) -> Self {
        Self {
            histogram: histogram.clone(),
            start: std::time::Instant::now(),
        }
    }
}

impl Drop for HistogramTimer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        self.histogram.observe(duration);
    }
}

/// Start timing for a histogram. Observation happens on drop.
#[macro_export]
macro_rules! time_histogram {
    ($histogram:expr) => {
        $crate::metrics::HistogramTimer::new(&$histogram)
    };
}
