//! # Path Codec Service
//!
//! Converts between schema-level paths and values and their encoded wire
//! form. Every conversion is checked against the schema first, so a pair
//! that encodes is a pair the peer can apply.

use crate::domain::{CodecError, VersionRange, WireElement, WirePath};
use crate::ports::outbound::BinaryCodec;
use shared_types::{EncodedPair, ElementKey, PropertyHandle, PropertyValue, SchemaVersion};
use wdm_01_property_schema::{
    ChangeSet, PathElement, PathValue, PropertyPath, SchemaError, TraitSchema,
};

/// Picks the version to speak for a request.
pub fn negotiate_version(
    range: VersionRange,
    requested: SchemaVersion,
) -> Result<SchemaVersion, SchemaError> {
    if range.contains(requested) {
        Ok(requested)
    } else {
        Err(SchemaError::version_unsupported(requested, range.min, range.max))
    }
}

/// Version range a schema supports.
pub fn version_range(schema: &TraitSchema) -> VersionRange {
    VersionRange {
        min: schema.min_version(),
        max: schema.max_version(),
    }
}

/// Schema-aware codec over a [`BinaryCodec`].
#[derive(Debug, Clone, Default)]
pub struct PathCodec<C> {
    codec: C,
}

impl<C: BinaryCodec> PathCodec<C> {
    /// Wraps a binary codec.
    pub fn new(codec: C) -> Self {
        Self { codec }
    }

    /// The wrapped binary codec.
    pub fn inner(&self) -> &C {
        &self.codec
    }

    // =========================================================================
    // PATHS
    // =========================================================================

    /// Renders a property path as tags and keys.
    pub fn to_wire(&self, schema: &TraitSchema, path: &PropertyPath) -> Result<WirePath, CodecError> {
        schema.check_path(path)?;
        let elements = path
            .elements()
            .iter()
            .map(|element| -> Result<WireElement, SchemaError> {
                Ok(match *element {
                    PathElement::Property(handle) => WireElement::Tag(schema.tag(handle)?),
                    PathElement::Element(key) => WireElement::Key(key.0),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(WirePath::new(elements))
    }

    /// Resolves a wire path against the schema.
    pub fn from_wire(&self, schema: &TraitSchema, wire: &WirePath) -> Result<PropertyPath, CodecError> {
        let mut current = PropertyHandle::ROOT;
        let mut awaiting_key = false;
        let mut elements = Vec::with_capacity(wire.elements.len());
        for element in &wire.elements {
            match *element {
                WireElement::Tag(tag) => {
                    if awaiting_key {
                        return Err(CodecError::MissingElementKey(current));
                    }
                    current = schema.find_child(current, tag)?;
                    awaiting_key = schema.is_dictionary(current);
                    elements.push(PathElement::Property(current));
                }
                WireElement::Key(key) => {
                    if !awaiting_key {
                        return Err(SchemaError::InvalidPath(format!(
                            "element key {} after non-dictionary {}",
                            key, current
                        ))
                        .into());
                    }
                    awaiting_key = false;
                    elements.push(PathElement::Element(ElementKey(key)));
                }
            }
        }
        Ok(PropertyPath::from_elements(elements))
    }

    /// Encodes a property path.
    pub fn encode_path(&self, schema: &TraitSchema, path: &PropertyPath) -> Result<Vec<u8>, CodecError> {
        let wire = self.to_wire(schema, path)?;
        self.codec.encode_path(&wire)
    }

    /// Decodes a property path. Unknown tags surface as `SchemaError::NotFound`.
    pub fn decode_path(&self, schema: &TraitSchema, bytes: &[u8]) -> Result<PropertyPath, CodecError> {
        let wire = self.codec.decode_path(bytes)?;
        self.from_wire(schema, &wire)
    }

    // =========================================================================
    // VALUES
    // =========================================================================

    /// Validates and encodes a leaf value.
    pub fn encode_value(
        &self,
        schema: &TraitSchema,
        handle: PropertyHandle,
        value: &PropertyValue,
    ) -> Result<Vec<u8>, CodecError> {
        schema.validate_value(handle, value)?;
        self.codec.encode_value(schema.leaf_type(handle)?, value)
    }

    /// Decodes and validates a leaf value.
    pub fn decode_value(
        &self,
        schema: &TraitSchema,
        handle: PropertyHandle,
        bytes: &[u8],
    ) -> Result<PropertyValue, CodecError> {
        let value = self.codec.decode_value(schema.leaf_type(handle)?, bytes)?;
        schema.validate_value(handle, &value)?;
        Ok(value)
    }

    // =========================================================================
    // PAIRS AND BATCHES
    // =========================================================================

    /// Encodes one leaf `(path, value)` pair.
    pub fn encode_pair(&self, schema: &TraitSchema, pair: &PathValue) -> Result<EncodedPair, CodecError> {
        let handle = schema.check_leaf_path(&pair.path)?;
        Ok(EncodedPair {
            path: self.encode_path(schema, &pair.path)?,
            value: self.encode_value(schema, handle, &pair.value)?,
        })
    }

    /// Decodes one leaf `(path, value)` pair.
    pub fn decode_pair(&self, schema: &TraitSchema, pair: &EncodedPair) -> Result<PathValue, CodecError> {
        let path = self.decode_path(schema, &pair.path)?;
        let handle = schema.check_leaf_path(&path)?;
        let value = self.decode_value(schema, handle, &pair.value)?;
        Ok(PathValue { path, value })
    }

    /// Encodes a change set into wire scopes and pairs.
    pub fn encode_change_set(
        &self,
        schema: &TraitSchema,
        changes: &ChangeSet,
    ) -> Result<(Vec<Vec<u8>>, Vec<EncodedPair>), CodecError> {
        let scopes = changes
            .scopes
            .iter()
            .map(|scope| self.encode_path(schema, scope))
            .collect::<Result<Vec<_>, _>>()?;
        let pairs = changes
            .values
            .iter()
            .map(|pair| self.encode_pair(schema, pair))
            .collect::<Result<Vec<_>, _>>()?;
        Ok((scopes, pairs))
    }

    /// Decodes wire scopes and pairs. The whole batch is decoded and
    /// validated before anything is returned; one bad pair fails it all.
    pub fn decode_change_set(
        &self,
        schema: &TraitSchema,
        scopes: &[Vec<u8>],
        pairs: &[EncodedPair],
    ) -> Result<ChangeSet, CodecError> {
        let scopes = scopes
            .iter()
            .map(|bytes| self.decode_path(schema, bytes))
            .collect::<Result<Vec<_>, _>>()?;
        let values = pairs
            .iter()
            .map(|pair| self.decode_pair(schema, pair))
            .collect::<Result<Vec<_>, _>>()?;
        if let Some(stray) = values.iter().find(|pv| !scopes.iter().any(|s| s.covers(&pv.path))) {
            return Err(SchemaError::InvalidPath(format!("{} outside every scope", stray.path)).into());
        }
        Ok(ChangeSet { scopes, values })
    }
}
