//! # Wire Messages
//!
//! The six WDM message shapes exchanged between a subscriber and a publisher.
//!
//! ## Flow
//!
//! ```text
//! Subscriber                               Publisher
//!     │ ── SubscribeRequest ──────────────────→ │
//!     │ ←────────────────── SubscribeResponse ── │
//!     │ ←──────────── Notify (full state, 0..n) ─ │
//!     │ ←──────────────────── Notify (diff) ──── │
//!     │ ── UpdateRequest ─────────────────────→ │
//!     │ ←───────────────────── UpdateResponse ── │
//!     │ ── Cancel ────────────────────────────→ │
//! ```
//!
//! Paths and values inside messages are opaque bytes produced by the path
//! codec; nothing here knows about schemas.

use crate::ids::{
    DataVersion, InstanceId, ProfileId, RequestId, ResourceId, SchemaVersion, SubscriptionId,
};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, Bytes};
use std::fmt;

/// One encoded `(path, value)` pair.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedPair {
    /// Codec-encoded wire path.
    #[serde_as(as = "Bytes")]
    pub path: Vec<u8>,
    /// Codec-encoded typed value.
    #[serde_as(as = "Bytes")]
    pub value: Vec<u8>,
}

/// Request to subscribe to instances of one profile on one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    /// Subscription this request opens or reconciles.
    pub subscription_id: SubscriptionId,
    /// Trait type.
    pub profile_id: ProfileId,
    /// Resource the instances are bound to.
    pub resource_id: ResourceId,
    /// Requested instances.
    pub instance_ids: Vec<InstanceId>,
    /// Schema version the subscriber speaks.
    pub requested_version: SchemaVersion,
    /// Subscriber's last-seen data version per instance (same order).
    pub last_seen: Vec<Option<DataVersion>>,
}

/// Why a publisher refused a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// No instance with this id is published.
    UnknownInstance(InstanceId),
    /// The requested schema version is outside the supported range.
    IncompatibleVersion {
        /// Version the subscriber asked for.
        requested: SchemaVersion,
        /// Lowest version the publisher speaks.
        min: SchemaVersion,
        /// Highest version the publisher speaks.
        max: SchemaVersion,
    },
    /// Publisher cannot take more subscriptions.
    ResourceExhausted,
    /// Request was malformed.
    Malformed(String),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownInstance(id) => write!(f, "unknown instance {}", id.0),
            Self::IncompatibleVersion { requested, min, max } => write!(
                f,
                "schema version {} outside {}..={}",
                requested.0, min.0, max.0
            ),
            Self::ResourceExhausted => f.write_str("resource exhausted"),
            Self::Malformed(reason) => write!(f, "malformed request: {}", reason),
        }
    }
}

/// Outcome of a subscribe request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscribeStatus {
    /// Subscription accepted.
    Accepted,
    /// Subscription refused.
    Rejected(RejectReason),
}

/// Publisher's answer to a subscribe request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeResponse {
    /// Subscription being answered.
    pub subscription_id: SubscriptionId,
    /// Accept or reject.
    pub status: SubscribeStatus,
    /// Current data version per requested instance (empty on reject).
    pub current_versions: Vec<DataVersion>,
}

/// Publisher → subscriber data push.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notify {
    /// Subscription the notify belongs to.
    pub subscription_id: SubscriptionId,
    /// Instance the pairs apply to.
    pub instance_id: InstanceId,
    /// Version the diff applies on top of (`None` for full state).
    pub base_version: Option<DataVersion>,
    /// Version after applying the pairs.
    pub version: DataVersion,
    /// True when `pairs` carries every present leaf of the trait.
    pub full_state: bool,
    /// Encoded paths whose previous content is replaced by `pairs`.
    #[serde_as(as = "Vec<Bytes>")]
    pub scopes: Vec<Vec<u8>>,
    /// Changed leaves.
    pub pairs: Vec<EncodedPair>,
}

/// Subscriber → publisher mutation request.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRequest {
    /// Subscription the update is sent on.
    pub subscription_id: SubscriptionId,
    /// Correlates the response.
    pub request_id: RequestId,
    /// Instance to mutate.
    pub instance_id: InstanceId,
    /// Version the mutation was made against.
    pub base_version: DataVersion,
    /// Encoded paths whose previous content is replaced by `pairs`.
    #[serde_as(as = "Vec<Bytes>")]
    pub scopes: Vec<Vec<u8>>,
    /// Leaves to write.
    pub pairs: Vec<EncodedPair>,
}

/// Outcome of an update request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateStatus {
    /// Applied; the instance is now at this version.
    Success(DataVersion),
    /// Base version was stale; carries the publisher's current version.
    VersionConflict(DataVersion),
    /// A path or value did not match the publisher's schema.
    SchemaError(String),
}

/// Publisher's answer to an update request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateResponse {
    /// Subscription the update was sent on.
    pub subscription_id: SubscriptionId,
    /// Request being answered.
    pub request_id: RequestId,
    /// Result.
    pub status: UpdateStatus,
}

/// Ends (part of) a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cancel {
    /// Subscription being canceled.
    pub subscription_id: SubscriptionId,
    /// Instances to drop.
    pub instance_ids: Vec<InstanceId>,
}

/// Any WDM protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WdmMessage {
    /// See [`SubscribeRequest`].
    SubscribeRequest(SubscribeRequest),
    /// See [`SubscribeResponse`].
    SubscribeResponse(SubscribeResponse),
    /// See [`Notify`].
    Notify(Notify),
    /// See [`UpdateRequest`].
    UpdateRequest(UpdateRequest),
    /// See [`UpdateResponse`].
    UpdateResponse(UpdateResponse),
    /// See [`Cancel`].
    Cancel(Cancel),
}

impl WdmMessage {
    /// Subscription the message belongs to.
    pub fn subscription_id(&self) -> SubscriptionId {
        match self {
            WdmMessage::SubscribeRequest(m) => m.subscription_id,
            WdmMessage::SubscribeResponse(m) => m.subscription_id,
            WdmMessage::Notify(m) => m.subscription_id,
            WdmMessage::UpdateRequest(m) => m.subscription_id,
            WdmMessage::UpdateResponse(m) => m.subscription_id,
            WdmMessage::Cancel(m) => m.subscription_id,
        }
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            WdmMessage::SubscribeRequest(_) => "subscribe_request",
            WdmMessage::SubscribeResponse(_) => "subscribe_response",
            WdmMessage::Notify(_) => "notify",
            WdmMessage::UpdateRequest(_) => "update_request",
            WdmMessage::UpdateResponse(_) => "update_response",
            WdmMessage::Cancel(_) => "cancel",
        }
    }
}
