//! # Subscription States
//!
//! ```text
//!            subscribe                accept + full notifies
//! [Idle] ─────────────→ [Subscribing] ─────────────────────→ [Established] ⇄ [Notifying]
//!   ↑                    │  reject / timeout                   │   │
//!   ├────────────────────┘                                     │   │ transport loss,
//!   │                                                          │   │ liveness
//!   │        drained                cancel                     │   ↓
//!   └──── [Canceling] ←──────────────────────────────────────────┘ [Aborting]
//!              ↑                                                       │
//!              └─────────────── cancel ───────────────────────────────┘
//!                            resubscribe success ──→ [Established]
//! ```
//!
//! `Aborting` is reachable from every state except `Idle`.

use super::errors::SubscriptionError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Internal subscription state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SubscriptionState {
    /// No subscription.
    #[default]
    Idle,
    /// Subscribe request sent, waiting for accept or reject.
    Subscribing,
    /// Steady state.
    Established,
    /// Applying an inbound notify.
    Notifying,
    /// Draining before cancel.
    Canceling,
    /// Session lost; state retained until resubscribe.
    Aborting,
}

impl SubscriptionState {
    /// True if `next` is a legal successor.
    pub fn can_transition_to(self, next: SubscriptionState) -> bool {
        use SubscriptionState::*;
        match (self, next) {
            (Idle, Subscribing) => true,
            (Subscribing, Established | Idle | Canceling) => true,
            (Established, Notifying | Canceling) => true,
            (Notifying, Established | Canceling) => true,
            (Canceling, Idle) => true,
            (Aborting, Established | Canceling | Idle) => true,
            (Idle | Aborting, Aborting) => false,
            (_, Aborting) => true,
            _ => false,
        }
    }

    /// True once the subscription exchanges data.
    pub fn is_active(self) -> bool {
        matches!(self, SubscriptionState::Established | SubscriptionState::Notifying)
    }
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SubscriptionState::Idle => "idle",
            SubscriptionState::Subscribing => "subscribing",
            SubscriptionState::Established => "established",
            SubscriptionState::Notifying => "notifying",
            SubscriptionState::Canceling => "canceling",
            SubscriptionState::Aborting => "aborting",
        };
        f.write_str(name)
    }
}

/// The three states applications branch on.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncStatus {
    /// Waiting for the first accept.
    Subscribing,
    /// Up to date as of the last successful exchange.
    Synchronized {
        /// When the last message was received.
        last_exchange: Instant,
    },
    /// Session lost; resubscribing.
    Reconnecting {
        /// Resubscribe attempts so far.
        retry_count: u32,
        /// Error that caused the abort, or the latest retry failure.
        last_error: Option<SubscriptionError>,
    },
}

/// Exponential backoff: `base * 2^(attempt-1)`, capped at `max`.
pub fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(31);
    base.checked_mul(1u32 << shift)
        .map_or(max, |delay| delay.min(max))
}

/// Enforces the transition table and keeps abort bookkeeping.
#[derive(Debug, Default)]
pub struct SubscriptionStateMachine {
    state: SubscriptionState,
    retry_count: u32,
    abort_cause: Option<SubscriptionError>,
    last_error: Option<SubscriptionError>,
    last_exchange: Option<Instant>,
    resubscribe_at: Option<Instant>,
}

impl SubscriptionStateMachine {
    /// Machine in `Idle`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state.
    pub fn state(&self) -> SubscriptionState {
        self.state
    }

    /// Resubscribe attempts since the last abort.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Error that caused the current abort.
    pub fn abort_cause(&self) -> Option<&SubscriptionError> {
        self.abort_cause.as_ref()
    }

    /// Error recorded by the last abort or failed retry.
    pub fn last_error(&self) -> Option<&SubscriptionError> {
        self.last_error.as_ref()
    }

    /// Time of the last received message.
    pub fn last_exchange(&self) -> Option<Instant> {
        self.last_exchange
    }

    /// When the next resubscribe may run.
    pub fn resubscribe_at(&self) -> Option<Instant> {
        self.resubscribe_at
    }

    /// Moves to `next`, returning the previous state.
    pub fn transition(
        &mut self,
        next: SubscriptionState,
    ) -> Result<SubscriptionState, SubscriptionError> {
        let from = self.state;
        if !from.can_transition_to(next) {
            return Err(SubscriptionError::InvalidTransition { from, to: next });
        }
        self.state = next;
        if next == SubscriptionState::Idle {
            self.retry_count = 0;
            self.resubscribe_at = None;
            self.abort_cause = None;
        }
        Ok(from)
    }

    /// Records a successful exchange.
    pub fn touch(&mut self, now: Instant) {
        self.last_exchange = Some(now);
    }

    /// Enters `Aborting`, records `error` and schedules the first resubscribe.
    pub fn abort(
        &mut self,
        error: SubscriptionError,
        delay: Duration,
        now: Instant,
    ) -> Result<SubscriptionState, SubscriptionError> {
        let from = self.transition(SubscriptionState::Aborting)?;
        self.retry_count = 0;
        self.abort_cause = Some(error.clone());
        self.last_error = Some(error);
        self.resubscribe_at = Some(now + delay);
        Ok(from)
    }

    /// Records a failed resubscribe and schedules the next one.
    pub fn retry_failed(&mut self, error: SubscriptionError, delay: Duration, now: Instant) {
        self.retry_count += 1;
        self.last_error = Some(error);
        self.resubscribe_at = Some(now + delay);
    }

    /// Leaves `Aborting` for `Established`, returning the abort cause.
    pub fn recover(&mut self, now: Instant) -> Result<Option<SubscriptionError>, SubscriptionError> {
        self.transition(SubscriptionState::Established)?;
        self.retry_count = 0;
        self.resubscribe_at = None;
        self.last_exchange = Some(now);
        self.last_error = None;
        Ok(self.abort_cause.take())
    }

    /// Externally visible status; `None` when idle or canceling.
    pub fn status(&self) -> Option<SyncStatus> {
        match self.state {
            SubscriptionState::Idle | SubscriptionState::Canceling => None,
            SubscriptionState::Subscribing => Some(SyncStatus::Subscribing),
            SubscriptionState::Established | SubscriptionState::Notifying => {
                self.last_exchange.map(|last_exchange| SyncStatus::Synchronized { last_exchange })
            }
            SubscriptionState::Aborting => Some(SyncStatus::Reconnecting {
                retry_count: self.retry_count,
                last_error: self.last_error.clone(),
            }),
        }
    }
}
