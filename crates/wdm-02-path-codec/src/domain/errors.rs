//! # Codec Errors

use shared_types::{PropertyHandle, TypeTag};
use thiserror::Error;
use wdm_01_property_schema::SchemaError;

/// Path/value codec error types.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// The binary encoder failed.
    #[error("Encode failed: {0}")]
    Encode(String),

    /// The payload could not be decoded.
    #[error("Decode failed: {0}")]
    Decode(String),

    /// The decoded value does not carry the expected type.
    #[error("Decoded {found}, expected {expected}")]
    TypeMismatch {
        /// Type the caller asked for
        expected: TypeTag,
        /// Type found in the payload
        found: TypeTag,
    },

    /// A wire path stopped at, or skipped past, a dictionary without a key.
    #[error("Missing element key after dictionary {0}")]
    MissingElementKey(PropertyHandle),

    /// The path or value does not fit the schema.
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),
}

impl CodecError {
    /// True if the error reflects a schema disagreement rather than
    /// corrupt bytes.
    pub fn is_schema_error(&self) -> bool {
        matches!(
            self,
            CodecError::Schema(_) | CodecError::TypeMismatch { .. } | CodecError::MissingElementKey(_)
        )
    }
}
