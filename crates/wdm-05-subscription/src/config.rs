//! # Subscription Configuration
//!
//! Timers, retry bounds and capacities for subscribers and publishers.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use wdm_04_update_batching::BatchingConfig;

/// Subscription configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    /// Per-exchange response timeout in milliseconds.
    pub exchange_timeout_ms: u64,

    /// Resends of one exchange before the subscription aborts.
    pub max_exchange_retries: u32,

    /// Subscribe attempts before `SubscriptionFailed`.
    pub max_subscribe_attempts: u32,

    /// First retry/resubscribe delay in milliseconds; doubles per attempt.
    pub backoff_base_ms: u64,

    /// Upper bound on the retry/resubscribe delay in milliseconds.
    pub backoff_max_ms: u64,

    /// Abort when nothing was received for this long. `None` disables.
    pub liveness_timeout_ms: Option<u64>,

    /// Update responses remembered per publisher for de-duplication.
    pub response_cache_size: usize,

    /// Subscriptions a publisher accepts.
    pub max_subscriptions: usize,

    /// Buffered events per subscriber before slow receivers lag.
    pub event_capacity: usize,

    /// Dirty set tuning.
    pub batching: BatchingConfig,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            exchange_timeout_ms: 5_000,
            max_exchange_retries: 2,
            max_subscribe_attempts: 5,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            liveness_timeout_ms: Some(120_000),
            response_cache_size: 256,
            max_subscriptions: 64,
            event_capacity: 64,
            batching: BatchingConfig::default(),
        }
    }
}

impl SubscriptionConfig {
    /// Create a config for testing (short timers, small bounds).
    pub fn for_testing() -> Self {
        Self {
            exchange_timeout_ms: 100,
            max_exchange_retries: 2,
            max_subscribe_attempts: 3,
            backoff_base_ms: 10,
            backoff_max_ms: 100,
            liveness_timeout_ms: None,
            response_cache_size: 8,
            max_subscriptions: 4,
            event_capacity: 32,
            batching: BatchingConfig::for_testing(),
        }
    }

    /// Per-exchange timeout.
    pub fn exchange_timeout(&self) -> Duration {
        Duration::from_millis(self.exchange_timeout_ms)
    }

    /// Liveness timeout, if enabled.
    pub fn liveness_timeout(&self) -> Option<Duration> {
        self.liveness_timeout_ms.map(Duration::from_millis)
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        crate::domain::backoff_delay(
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_max_ms),
            attempt,
        )
    }
}
