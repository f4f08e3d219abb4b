//! # Outbound Ports
//!
//! Capability traits for the application objects behind trait instances.
//! A publisher binds a [`TraitSource`], a subscriber binds a [`TraitSink`];
//! the catalog selects between them per instance.

use shared_types::{DataVersion, ElementKey, PropertyValue};
use thiserror::Error;
use wdm_01_property_schema::{ChangeSet, PropertyPath};

/// Errors raised by application data objects.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DataError {
    /// No value at the path (absent optional property or unknown element).
    #[error("No value at {0}")]
    NotPresent(PropertyPath),

    /// The application refused the write.
    #[error("Write rejected: {0}")]
    Rejected(String),
}

/// Read access shared by sources and sinks.
pub trait PropertyReader: Send + Sync {
    /// Current value of a leaf.
    fn read_property(&self, path: &PropertyPath) -> Result<PropertyValue, DataError>;

    /// Live element keys of a dictionary container, ascending.
    fn element_keys(&self, dictionary: &PropertyPath) -> Vec<ElementKey>;
}

/// Authoritative trait data on the publisher side.
pub trait TraitSource: PropertyReader {
    /// Current data version.
    fn version(&self) -> DataVersion;

    /// Applies a validated batch atomically and bumps the version.
    ///
    /// Either every change is applied and the new version returned, or
    /// nothing changes.
    fn write_properties(&self, changes: &ChangeSet) -> Result<DataVersion, DataError>;
}

/// Local mirror of a remote trait on the subscriber side.
pub trait TraitSink: PropertyReader {
    /// Version of the last notify applied, if any.
    fn applied_version(&self) -> Option<DataVersion>;

    /// Local mutation by the application. Does not touch the version.
    fn write_property(&self, path: &PropertyPath, value: PropertyValue) -> Result<(), DataError>;

    /// Applies a validated notify batch atomically and records its version.
    fn apply_notify(&self, version: DataVersion, changes: &ChangeSet) -> Result<(), DataError>;
}
