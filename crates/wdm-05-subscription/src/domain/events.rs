//! # Subscription Events
//!
//! Broadcast to applications so they can follow state changes without
//! polling `status()`.

use super::errors::SubscriptionError;
use super::state::SubscriptionState;
use shared_types::{DataVersion, InstanceId, RequestId};
use std::fmt;

/// Something the application may want to react to.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    /// The state machine moved.
    StateChanged {
        /// Previous state.
        from: SubscriptionState,
        /// New state.
        to: SubscriptionState,
        /// Error that caused the move, if any.
        error: Option<SubscriptionError>,
    },
    /// A notify was applied to the local sink.
    NotifyApplied {
        /// Instance updated.
        instance: InstanceId,
        /// Version now held.
        version: DataVersion,
        /// True for a full-state replacement.
        full_state: bool,
    },
    /// The publisher committed a local update.
    UpdateCommitted {
        /// Instance updated.
        instance: InstanceId,
        /// Request that carried it.
        request_id: RequestId,
        /// Version produced.
        version: DataVersion,
    },
    /// A local update was discarded for a stale base version.
    Conflict {
        /// Instance in conflict.
        instance: InstanceId,
        /// Discarded request.
        request_id: RequestId,
        /// Publisher's version.
        current: DataVersion,
    },
    /// Full state was requested for instances whose view diverged.
    ReconciliationStarted {
        /// Instances being reconciled.
        instances: Vec<InstanceId>,
    },
    /// The subscription is back after an abort.
    Recovered {
        /// Error that caused the abort.
        from: SubscriptionError,
    },
    /// The publisher dropped an instance from the subscription.
    InstanceRemoved(InstanceId),
    /// A failure that ended one exchange but not the subscription.
    Error(SubscriptionError),
}

impl fmt::Display for SubscriptionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StateChanged { from, to, error: None } => write!(f, "{} -> {}", from, to),
            Self::StateChanged {
                from,
                to,
                error: Some(error),
            } => write!(f, "{} -> {} ({})", from, to, error),
            Self::NotifyApplied {
                instance, version, ..
            } => write!(f, "instance {} at {}", instance.0, version),
            Self::UpdateCommitted {
                instance, version, ..
            } => write!(f, "instance {} committed {}", instance.0, version),
            Self::Conflict {
                instance, current, ..
            } => write!(f, "instance {} conflicts, publisher at {}", instance.0, current),
            Self::ReconciliationStarted { instances } => {
                write!(f, "reconciling {} instances", instances.len())
            }
            Self::Recovered { from } => write!(f, "recovered from {}", from),
            Self::InstanceRemoved(instance) => write!(f, "instance {} removed", instance.0),
            Self::Error(error) => write!(f, "{}", error),
        }
    }
}
