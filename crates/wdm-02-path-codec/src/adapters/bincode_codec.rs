//! Bincode Codec Adapter
//!
//! Implements `BinaryCodec` with bincode's varint encoding and a payload
//! size limit, so corrupt length prefixes cannot trigger large allocations.

use crate::domain::{CodecError, WirePath};
use crate::ports::outbound::BinaryCodec;
use bincode::Options;
use shared_types::{PropertyValue, TypeTag};
use tracing::debug;

/// Default upper bound on one encoded path or value.
pub const DEFAULT_MAX_PAYLOAD: u64 = 64 * 1024;

/// `BinaryCodec` backed by bincode.
#[derive(Debug, Clone, Copy)]
pub struct BincodeCodec {
    max_payload: u64,
}

impl Default for BincodeCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD)
    }
}

impl BincodeCodec {
    /// Codec rejecting payloads larger than `max_payload` bytes.
    pub fn new(max_payload: u64) -> Self {
        Self { max_payload }
    }

    fn options(&self) -> impl Options {
        bincode::DefaultOptions::new().with_limit(self.max_payload)
    }
}

fn check_type(expected: TypeTag, value: &PropertyValue) -> Result<(), CodecError> {
    match value.type_tag() {
        Some(found) if found != expected => Err(CodecError::TypeMismatch { expected, found }),
        _ => Ok(()),
    }
}

impl BinaryCodec for BincodeCodec {
    fn encode_path(&self, path: &WirePath) -> Result<Vec<u8>, CodecError> {
        self.options()
            .serialize(path)
            .map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode_path(&self, bytes: &[u8]) -> Result<WirePath, CodecError> {
        self.options().deserialize(bytes).map_err(|e| {
            debug!(len = bytes.len(), error = %e, "[wdm-02] path decode failed");
            CodecError::Decode(e.to_string())
        })
    }

    fn encode_value(&self, ty: TypeTag, value: &PropertyValue) -> Result<Vec<u8>, CodecError> {
        check_type(ty, value)?;
        self.options()
            .serialize(value)
            .map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode_value(&self, ty: TypeTag, bytes: &[u8]) -> Result<PropertyValue, CodecError> {
        let value: PropertyValue = self.options().deserialize(bytes).map_err(|e| {
            debug!(len = bytes.len(), error = %e, "[wdm-02] value decode failed");
            CodecError::Decode(e.to_string())
        })?;
        check_type(ty, &value)?;
        Ok(value)
    }
}
