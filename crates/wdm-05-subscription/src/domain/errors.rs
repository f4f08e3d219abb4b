//! # Domain Errors
//!
//! Error types for the subscription engine, grouped into classes that decide
//! whether a failure is retried.

use super::state::SubscriptionState;
use shared_types::{DataVersion, ExchangeHandle, InstanceId, PeerId, RejectReason, RequestId};
use thiserror::Error;
use wdm_01_property_schema::SchemaError;
use wdm_02_path_codec::CodecError;
use wdm_03_trait_catalog::{CatalogError, CatalogHandle, DataError};
use wdm_04_update_batching::BatchError;

/// Transport-level failure reported by the exchange layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The peer cannot be reached.
    #[error("Peer unreachable: {0}")]
    Unreachable(PeerId),

    /// The message could not be sent.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// The exchange was closed.
    #[error("Exchange closed: {0}")]
    Closed(ExchangeHandle),

    /// The exchange was never opened.
    #[error("Unknown exchange: {0}")]
    UnknownExchange(ExchangeHandle),
}

/// Coarse error classes used for retry decisions and metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Peer/schema incompatibility, never retried.
    Schema,
    /// Stale base version, resolved by reconciliation.
    Conflict,
    /// Lost messages or connectivity, retried.
    Transport,
    /// Local catalog misuse.
    Catalog,
    /// Anything else.
    Fatal,
}

impl ErrorClass {
    /// Metric label.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Schema => "schema",
            ErrorClass::Conflict => "conflict",
            ErrorClass::Transport => "transport",
            ErrorClass::Catalog => "catalog",
            ErrorClass::Fatal => "fatal",
        }
    }
}

/// Subscription error types.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SubscriptionError {
    /// Publisher refused the subscription.
    #[error("Subscription rejected: {0}")]
    SubscriptionRejected(RejectReason),

    /// No subscribe response within the exchange timeout.
    #[error("Subscription timed out")]
    SubscriptionTimeout,

    /// Subscribe attempts exhausted.
    #[error("Subscription failed after {attempts} attempts: {last_error}")]
    SubscriptionFailed {
        /// Attempts made
        attempts: u32,
        /// Error of the final attempt
        last_error: Box<SubscriptionError>,
    },

    /// An exchange ran out of retries without a response.
    #[error("Exchange for {0} timed out")]
    ExchangeTimeout(RequestId),

    /// Nothing was received within the liveness timeout.
    #[error("Liveness timeout")]
    LivenessTimeout,

    /// Update was made against a stale version.
    #[error("Version conflict on instance {instance}: current {current}")]
    VersionConflict {
        /// Instance the update targeted
        instance: InstanceId,
        /// Publisher's version
        current: DataVersion,
    },

    /// Publisher refused an update as invalid.
    #[error("Update {request_id} rejected: {reason}")]
    UpdateRejected {
        /// Rejected request
        request_id: RequestId,
        /// Publisher's reason
        reason: String,
    },

    /// Transport failure.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Schema incompatibility.
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    /// Encoding or decoding failed.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Catalog misuse.
    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    /// Dirty set bookkeeping failed.
    #[error("Batch error: {0}")]
    Batch(#[from] BatchError),

    /// Application sink or source refused.
    #[error("Data error: {0}")]
    Data(#[from] DataError),

    /// Operation not allowed in the current state.
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        /// Attempted operation
        operation: &'static str,
        /// State at the time
        state: SubscriptionState,
    },

    /// Transition not in the table.
    #[error("Invalid transition {from} -> {to}")]
    InvalidTransition {
        /// Current state
        from: SubscriptionState,
        /// Requested state
        to: SubscriptionState,
    },

    /// Handle is not part of this subscription.
    #[error("Handle {0} is not subscribed")]
    NotSubscribed(CatalogHandle),

    /// Subscribe called without handles.
    #[error("No trait instances to subscribe to")]
    EmptySubscription,

    /// Handles span more than one (profile, resource).
    #[error("Subscribed instances must share one profile and resource")]
    MixedTargets,

    /// Request id is not tracked.
    #[error("Unknown request {0}")]
    UnknownRequest(RequestId),

    /// The subscription was canceled.
    #[error("Subscription canceled")]
    Canceled,
}

impl SubscriptionError {
    /// Error class.
    pub fn class(&self) -> ErrorClass {
        match self {
            SubscriptionError::Schema(_)
            | SubscriptionError::Codec(_)
            | SubscriptionError::UpdateRejected { .. } => ErrorClass::Schema,
            SubscriptionError::SubscriptionRejected(RejectReason::IncompatibleVersion {
                ..
            }) => ErrorClass::Schema,
            SubscriptionError::VersionConflict { .. } => ErrorClass::Conflict,
            SubscriptionError::Batch(BatchError::VersionConflict { .. }) => ErrorClass::Conflict,
            SubscriptionError::Transport(_)
            | SubscriptionError::SubscriptionTimeout
            | SubscriptionError::ExchangeTimeout(_)
            | SubscriptionError::LivenessTimeout => ErrorClass::Transport,
            SubscriptionError::Catalog(_) | SubscriptionError::NotSubscribed(_) => {
                ErrorClass::Catalog
            }
            _ => ErrorClass::Fatal,
        }
    }

    /// True if the failure may clear up on its own.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transport
    }
}
