//! # Identifiers
//!
//! Addressing primitives shared by every WDM subsystem.
//!
//! ## Clusters
//!
//! - **Trait addressing**: `ProfileId`, `ResourceId`, `InstanceId`, `TraitInstanceKey`
//! - **Schema addressing**: `PropertyHandle`, `ElementKey`, `SchemaVersion`
//! - **Sessions**: `PeerId`, `SubscriptionId`, `RequestId`, `ExchangeHandle`
//! - **Versioning**: `DataVersion`

use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// TRAIT ADDRESSING
// =============================================================================

/// Identifies a trait type (the schema a trait instance conforms to).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProfileId(pub u32);

/// The device, account or structure a trait instance is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId(pub u64);

/// Distinguishes multiple instances of one profile on one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(pub u64);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Full wire address of a trait instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TraitInstanceKey {
    /// Trait type.
    pub profile: ProfileId,
    /// Owning resource.
    pub resource: ResourceId,
    /// Instance on that resource.
    pub instance: InstanceId,
}

impl TraitInstanceKey {
    /// Creates a key from raw parts.
    pub fn new(profile: u32, resource: u64, instance: u64) -> Self {
        Self {
            profile: ProfileId(profile),
            resource: ResourceId(resource),
            instance: InstanceId(instance),
        }
    }
}

impl fmt::Display for TraitInstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:#010x}/{:#x}/{}",
            self.profile.0, self.resource.0, self.instance.0
        )
    }
}

// =============================================================================
// SCHEMA ADDRESSING
// =============================================================================

/// Index of a property in a trait schema's property map.
///
/// Handle 0 is always the trait root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PropertyHandle(pub u16);

impl PropertyHandle {
    /// The root of every trait schema.
    pub const ROOT: PropertyHandle = PropertyHandle(0);

    /// Returns true for the root handle.
    pub fn is_root(self) -> bool {
        self == Self::ROOT
    }

    /// Index into the property map.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PropertyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Key of an element inside an array or dictionary property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ElementKey(pub u16);

/// Version of a trait schema (not of its data).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SchemaVersion(pub u16);

// =============================================================================
// VERSIONING
// =============================================================================

/// Per-instance data version used for optimistic concurrency.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct DataVersion(pub u64);

impl DataVersion {
    /// Version following this one.
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl fmt::Display for DataVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

// =============================================================================
// SESSIONS
// =============================================================================

/// A remote node reachable through the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{:x}", self.0)
    }
}

/// Identifies a subscription on both ends of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

impl SubscriptionId {
    /// Random subscription id.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().as_u128() as u64)
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{:016x}", self.0)
    }
}

/// Correlates an update request with its response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// One side of a transport exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExchangeHandle(pub u64);

impl fmt::Display for ExchangeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ex-{}", self.0)
    }
}
