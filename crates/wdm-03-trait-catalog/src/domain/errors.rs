//! # Domain Errors
//!
//! Catalog errors are synchronous returns and are never retried.

use super::entities::CatalogHandle;
use shared_types::{ProfileId, TraitInstanceKey};
use thiserror::Error;
use wdm_01_property_schema::SchemaError;

/// Trait catalog error types.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    /// The handle's slot was unregistered (and possibly reused).
    #[error("Stale catalog handle {0}")]
    StaleHandle(CatalogHandle),

    /// No instance with this key is registered.
    #[error("Trait instance {0} not found")]
    InstanceNotFound(TraitInstanceKey),

    /// An instance with this key is already registered.
    #[error("Trait instance {0} already registered")]
    DuplicateInstance(TraitInstanceKey),

    /// The catalog is at capacity.
    #[error("Catalog full: {capacity} instances")]
    CatalogFull {
        /// Configured capacity
        capacity: usize,
    },

    /// The source or sink behind the binding has been dropped.
    #[error("Binding for {0} has been dropped")]
    BindingDropped(TraitInstanceKey),

    /// A source was asked for where a sink is bound, or vice versa.
    #[error("Trait instance {key} is bound as a {actual}")]
    WrongBinding {
        /// Instance looked up
        key: TraitInstanceKey,
        /// Binding kind actually registered
        actual: &'static str,
    },

    /// Schema profile differs from the key's profile.
    #[error("Schema profile {schema:?} does not match key profile {key:?}")]
    ProfileMismatch {
        /// Profile in the instance key
        key: ProfileId,
        /// Profile of the supplied schema
        schema: ProfileId,
    },

    /// The supplied schema breaks a structural invariant.
    #[error("Invalid schema: {0}")]
    InvalidSchema(#[from] SchemaError),
}
