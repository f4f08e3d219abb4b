//! # Domain Errors
//!
//! Error types for the Property Schema Engine. Schema errors describe a
//! programming or data-shape mistake and are never retried.

use shared_types::{PropertyHandle, ProfileId, SchemaVersion, TypeTag};
use thiserror::Error;

/// Schema engine error types.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    /// Handle is outside the property map.
    #[error("Unknown property handle {0}")]
    UnknownHandle(PropertyHandle),

    /// No child with this tag under the parent.
    #[error("No child with tag {tag} under {parent}")]
    NotFound {
        /// Parent that was searched
        parent: PropertyHandle,
        /// Context tag looked up
        tag: u32,
    },

    /// A non-root entry names a parent that does not precede it.
    #[error("Property {handle} has cyclic or invalid parent {parent}")]
    CyclicOrInvalidParent {
        /// Offending entry
        handle: PropertyHandle,
        /// Parent it names
        parent: PropertyHandle,
    },

    /// Property map has no root entry.
    #[error("Schema has no root property")]
    EmptySchema,

    /// Supported version range is inverted.
    #[error("Invalid version range: min {min} > max {max}")]
    InvalidVersionRange {
        /// Lower bound
        min: u16,
        /// Upper bound
        max: u16,
    },

    /// Leaf type table does not line up with the property map.
    #[error("Leaf type table has {leaf_types} entries, property map has {properties}")]
    TableLengthMismatch {
        /// Property map length
        properties: usize,
        /// Leaf type table length
        leaf_types: usize,
    },

    /// A leaf has no value type.
    #[error("Leaf {0} has no value type")]
    MissingLeafType(PropertyHandle),

    /// Two siblings share a context tag.
    #[error("Duplicate tag {tag} under {parent}")]
    DuplicateTag {
        /// Shared parent
        parent: PropertyHandle,
        /// Repeated tag
        tag: u32,
    },

    /// The root was marked optional, nullable or dictionary.
    #[error("Root property cannot carry flags")]
    FlaggedRoot,

    /// Value type differs from the leaf type.
    #[error("Type mismatch at {handle}: expected {expected}, found {found}")]
    TypeMismatch {
        /// Leaf being written
        handle: PropertyHandle,
        /// Declared leaf type
        expected: TypeTag,
        /// Type of the supplied value
        found: TypeTag,
    },

    /// Null written to a non-nullable property.
    #[error("Null not allowed at {0}")]
    NullNotAllowed(PropertyHandle),

    /// A value was addressed to a struct or container.
    #[error("Property {0} is not a leaf")]
    NotALeaf(PropertyHandle),

    /// A dictionary handle was not followed by an element key.
    #[error("Missing element key after dictionary {0}")]
    MissingElementKey(PropertyHandle),

    /// Path does not follow the property tree.
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// More properties than a 16-bit handle can address.
    #[error("Schema has {0} properties, handles address at most 65536")]
    TooManyProperties(usize),

    /// Requested schema version is outside the supported range.
    #[error("Schema version {requested} unsupported (supported {min}..={max})")]
    VersionUnsupported {
        /// Version asked for
        requested: u16,
        /// Lowest supported
        min: u16,
        /// Highest supported
        max: u16,
    },

    /// A schema for this profile is already registered.
    #[error("Profile {0:?} already registered")]
    DuplicateProfile(ProfileId),

    /// No schema registered for this profile.
    #[error("Unknown profile {0:?}")]
    UnknownProfile(ProfileId),
}

impl SchemaError {
    /// Builds a `VersionUnsupported` from typed versions.
    pub fn version_unsupported(
        requested: SchemaVersion,
        min: SchemaVersion,
        max: SchemaVersion,
    ) -> Self {
        SchemaError::VersionUnsupported {
            requested: requested.0,
            min: min.0,
            max: max.0,
        }
    }
}
