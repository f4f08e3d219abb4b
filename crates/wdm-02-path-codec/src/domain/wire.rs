//! # Wire Paths and Version Tags
//!
//! A `WirePath` is the schema-independent rendering of a property path: the
//! context tag of every property step plus the element keys after
//! dictionaries. Peers with different handle numbering but the same tags
//! agree on it.

use serde::{Deserialize, Serialize};
use shared_types::{DataVersion, SchemaVersion};

/// One step of a wire path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WireElement {
    /// Context tag of a property.
    Tag(u32),
    /// Dictionary element key.
    Key(u16),
}

/// Tag/key sequence from the root (exclusive).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct WirePath {
    /// Steps in root-to-leaf order.
    pub elements: Vec<WireElement>,
}

impl WirePath {
    /// Wraps raw elements.
    pub fn new(elements: Vec<WireElement>) -> Self {
        Self { elements }
    }
}

/// Supported schema version range of one side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRange {
    /// Lowest supported version.
    pub min: SchemaVersion,
    /// Highest supported version.
    pub max: SchemaVersion,
}

impl VersionRange {
    /// Range from raw bounds.
    pub fn new(min: u16, max: u16) -> Self {
        Self {
            min: SchemaVersion(min),
            max: SchemaVersion(max),
        }
    }

    /// True if `version` lies in the range.
    pub fn contains(&self, version: SchemaVersion) -> bool {
        self.min <= version && version <= self.max
    }
}

/// Schema and data version attached to an encoded update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionTag {
    /// Schema version the paths were encoded with.
    pub schema: SchemaVersion,
    /// Data version the update was made against.
    pub data: DataVersion,
}
