//! # Outbound Ports
//!
//! The low-level binary codec this subsystem consumes. It knows wire paths
//! and typed values but nothing about schemas.

use crate::domain::{CodecError, WirePath};
use shared_types::{PropertyValue, TypeTag};

/// Binary codec - outbound port.
pub trait BinaryCodec: Send + Sync {
    /// Encodes a wire path.
    fn encode_path(&self, path: &WirePath) -> Result<Vec<u8>, CodecError>;

    /// Decodes a wire path.
    fn decode_path(&self, bytes: &[u8]) -> Result<WirePath, CodecError>;

    /// Encodes a value of the given type (`Null` is allowed for any type).
    fn encode_value(&self, ty: TypeTag, value: &PropertyValue) -> Result<Vec<u8>, CodecError>;

    /// Decodes a value, rejecting payloads of another type.
    fn decode_value(&self, ty: TypeTag, bytes: &[u8]) -> Result<PropertyValue, CodecError>;
}

impl<C: BinaryCodec + ?Sized> BinaryCodec for std::sync::Arc<C> {
    fn encode_path(&self, path: &WirePath) -> Result<Vec<u8>, CodecError> {
        (**self).encode_path(path)
    }

    fn decode_path(&self, bytes: &[u8]) -> Result<WirePath, CodecError> {
        (**self).decode_path(bytes)
    }

    fn encode_value(&self, ty: TypeTag, value: &PropertyValue) -> Result<Vec<u8>, CodecError> {
        (**self).encode_value(ty, value)
    }

    fn decode_value(&self, ty: TypeTag, bytes: &[u8]) -> Result<PropertyValue, CodecError> {
        (**self).decode_value(ty, bytes)
    }
}
