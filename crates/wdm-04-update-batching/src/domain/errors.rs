//! # Domain Errors

use super::entities::FlushTicket;
use shared_types::{DataVersion, TraitInstanceKey};
use thiserror::Error;
use wdm_01_property_schema::SchemaError;
use wdm_02_path_codec::CodecError;
use wdm_03_trait_catalog::DataError;

/// Update batching error types.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BatchError {
    /// Ticket was already confirmed or abandoned.
    #[error("Unknown flush ticket {0:?}")]
    UnknownTicket(FlushTicket),

    /// A flush for this instance has not been confirmed or abandoned yet.
    #[error("Flush already in progress for {0}")]
    FlushInProgress(TraitInstanceKey),

    /// Base version does not match the current version.
    #[error("Version conflict: base {base}, current {current}")]
    VersionConflict {
        /// Version the update was made against
        base: DataVersion,
        /// Version the owner is at
        current: DataVersion,
    },

    /// Path does not fit the schema.
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    /// A flushed pair could not be encoded.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// The reader refused a read.
    #[error("Data error: {0}")]
    Data(#[from] DataError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_conflict_error() {
        let err = BatchError::VersionConflict {
            base: DataVersion(5),
            current: DataVersion(6),
        };
        assert_eq!(err.to_string(), "Version conflict: base v5, current v6");
    }
}
