//! # Domain Invariants
//!
//! Structural rules every trait schema must satisfy before it is used.

use super::entities::PropertyInfo;
use super::errors::SchemaError;
use super::handle_set::HandleSet;
use shared_types::{PropertyHandle, SchemaVersion, TypeTag};
use std::collections::HashSet;

/// Invariant: the map has a root entry.
pub fn invariant_has_root(properties: &[PropertyInfo]) -> Result<(), SchemaError> {
    if properties.is_empty() {
        return Err(SchemaError::EmptySchema);
    }
    Ok(())
}

/// Largest property map a 16-bit handle can address, root included.
pub const MAX_PROPERTIES: usize = u16::MAX as usize + 1;

/// Invariant: every entry is addressable by a [`PropertyHandle`].
pub fn invariant_handle_range(properties: &[PropertyInfo]) -> Result<(), SchemaError> {
    if properties.len() > MAX_PROPERTIES {
        return Err(SchemaError::TooManyProperties(properties.len()));
    }
    Ok(())
}

/// Invariant: every non-root entry's parent precedes it.
///
/// This rules out cycles and lets traversals rely on descendants having a
/// higher index than their ancestors.
pub fn invariant_parent_precedes(properties: &[PropertyInfo]) -> Result<(), SchemaError> {
    for (index, info) in properties.iter().enumerate().skip(1) {
        if info.parent.index() >= index {
            return Err(SchemaError::CyclicOrInvalidParent {
                handle: PropertyHandle(index as u16),
                parent: info.parent,
            });
        }
    }
    Ok(())
}

/// Invariant: siblings have distinct tags.
pub fn invariant_unique_sibling_tags(properties: &[PropertyInfo]) -> Result<(), SchemaError> {
    let mut seen = HashSet::with_capacity(properties.len());
    for info in properties.iter().skip(1) {
        if !seen.insert((info.parent, info.tag)) {
            return Err(SchemaError::DuplicateTag {
                parent: info.parent,
                tag: info.tag,
            });
        }
    }
    Ok(())
}

/// Invariant: `min <= max`.
pub fn invariant_version_range(
    min: SchemaVersion,
    max: SchemaVersion,
) -> Result<(), SchemaError> {
    if min > max {
        return Err(SchemaError::InvalidVersionRange {
            min: min.0,
            max: max.0,
        });
    }
    Ok(())
}

/// Invariant: one leaf type slot per property, and every leaf has a type.
pub fn invariant_leaf_types(
    properties: &[PropertyInfo],
    leaf_types: &[Option<TypeTag>],
) -> Result<(), SchemaError> {
    if leaf_types.len() != properties.len() {
        return Err(SchemaError::TableLengthMismatch {
            properties: properties.len(),
            leaf_types: leaf_types.len(),
        });
    }
    let mut has_children = vec![false; properties.len()];
    for info in properties.iter().skip(1) {
        if let Some(slot) = has_children.get_mut(info.parent.index()) {
            *slot = true;
        }
    }
    for (index, ty) in leaf_types.iter().enumerate().skip(1) {
        if !has_children[index] && ty.is_none() {
            return Err(SchemaError::MissingLeafType(PropertyHandle(index as u16)));
        }
    }
    Ok(())
}

/// Invariant: the root carries no flags.
pub fn invariant_unflagged_root(sets: &[&HandleSet]) -> Result<(), SchemaError> {
    if sets.iter().any(|set| set.contains(PropertyHandle::ROOT)) {
        return Err(SchemaError::FlaggedRoot);
    }
    Ok(())
}
