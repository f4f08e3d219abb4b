//! # Trait Schema
//!
//! The immutable description of one trait type and every query the rest of
//! the stack runs against it.
//!
//! ## Layout
//!
//! ```text
//! handle  parent  tag   leaf type
//!   0       0      0     -          (root)
//!   1       0      1     Float
//!   2       0      4     -          (struct)
//!   3       2      1     Bool
//! ```
//!
//! A property is a leaf iff no entry names it as parent. Parents always
//! precede their children, so a subtree's members all sit after its root.

use super::errors::SchemaError;
use super::handle_set::HandleSet;
use super::invariants::{
    invariant_handle_range, invariant_has_root, invariant_leaf_types, invariant_parent_precedes,
    invariant_unflagged_root, invariant_unique_sibling_tags, invariant_version_range,
};
use super::value_objects::{PathElement, PropertyPath};
use shared_types::{ElementKey, ProfileId, PropertyHandle, PropertyValue, SchemaVersion, TypeTag};
use std::borrow::Cow;

/// One entry of the property map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PropertyInfo {
    /// Parent handle (the root names itself).
    pub parent: PropertyHandle,
    /// Context tag within the parent.
    pub tag: u32,
}

impl PropertyInfo {
    /// Entry from raw parent index and tag.
    pub const fn new(parent: u16, tag: u32) -> Self {
        Self {
            parent: PropertyHandle(parent),
            tag,
        }
    }

    /// The root entry.
    pub const ROOT: PropertyInfo = PropertyInfo::new(0, 0);
}

/// Static tables for a schema defined at compile time.
#[derive(Debug, Clone, Copy)]
pub struct SchemaTables {
    /// Property map; entry 0 is the root.
    pub properties: &'static [PropertyInfo],
    /// Leaf value type per handle (`None` for structs and containers).
    pub leaf_types: &'static [Option<TypeTag>],
    /// Optional handle bitfield.
    pub optional: &'static [u64],
    /// Nullable handle bitfield.
    pub nullable: &'static [u64],
    /// Dictionary handle bitfield.
    pub dictionary: &'static [u64],
    /// Ephemeral handle bitfield.
    pub ephemeral: &'static [u64],
    /// Lowest supported schema version.
    pub min_version: SchemaVersion,
    /// Highest supported schema version.
    pub max_version: SchemaVersion,
}

/// Immutable description of a trait type.
#[derive(Debug, Clone, PartialEq)]
pub struct TraitSchema {
    profile_id: ProfileId,
    properties: Cow<'static, [PropertyInfo]>,
    leaf_types: Cow<'static, [Option<TypeTag>]>,
    optional: HandleSet,
    nullable: HandleSet,
    dictionary: HandleSet,
    ephemeral: HandleSet,
    min_version: SchemaVersion,
    max_version: SchemaVersion,
}

impl TraitSchema {
    /// Wraps compile-time tables without copying them.
    ///
    /// The tables are not validated here; registries validate on insert.
    pub const fn from_tables(profile_id: ProfileId, tables: SchemaTables) -> Self {
        Self {
            profile_id,
            properties: Cow::Borrowed(tables.properties),
            leaf_types: Cow::Borrowed(tables.leaf_types),
            optional: HandleSet::from_static(tables.optional),
            nullable: HandleSet::from_static(tables.nullable),
            dictionary: HandleSet::from_static(tables.dictionary),
            ephemeral: HandleSet::from_static(tables.ephemeral),
            min_version: tables.min_version,
            max_version: tables.max_version,
        }
    }

    /// Starts building an owned schema.
    pub fn builder(profile_id: ProfileId) -> SchemaBuilder {
        SchemaBuilder::new(profile_id)
    }

    /// Checks every structural invariant.
    pub fn validate(&self) -> Result<(), SchemaError> {
        invariant_has_root(&self.properties)?;
        invariant_handle_range(&self.properties)?;
        invariant_parent_precedes(&self.properties)?;
        invariant_unique_sibling_tags(&self.properties)?;
        invariant_version_range(self.min_version, self.max_version)?;
        invariant_leaf_types(&self.properties, &self.leaf_types)?;
        invariant_unflagged_root(&[&self.optional, &self.nullable, &self.dictionary])?;
        Ok(())
    }

    // =========================================================================
    // IDENTITY
    // =========================================================================

    /// Trait type described by this schema.
    pub fn profile_id(&self) -> ProfileId {
        self.profile_id
    }

    /// Number of entries in the property map, root included.
    pub fn len(&self) -> usize {
        self.properties.len()
    }

    /// True if the map has no entries (never true for a valid schema).
    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    /// Lowest supported schema version.
    pub fn min_version(&self) -> SchemaVersion {
        self.min_version
    }

    /// Highest supported schema version.
    pub fn max_version(&self) -> SchemaVersion {
        self.max_version
    }

    /// `min <= version <= max`.
    pub fn version_is_supported(&self, version: SchemaVersion) -> bool {
        self.min_version <= version && version <= self.max_version
    }

    /// `Ok(requested)` if supported, else `VersionUnsupported`.
    pub fn negotiate_version(&self, requested: SchemaVersion) -> Result<SchemaVersion, SchemaError> {
        if self.version_is_supported(requested) {
            Ok(requested)
        } else {
            Err(SchemaError::version_unsupported(
                requested,
                self.min_version,
                self.max_version,
            ))
        }
    }

    // =========================================================================
    // NAVIGATION
    // =========================================================================

    /// Parent and tag of a handle.
    pub fn resolve(&self, handle: PropertyHandle) -> Result<PropertyInfo, SchemaError> {
        self.properties
            .get(handle.index())
            .copied()
            .ok_or(SchemaError::UnknownHandle(handle))
    }

    /// Parent of a handle (the root is its own parent).
    pub fn parent(&self, handle: PropertyHandle) -> Result<PropertyHandle, SchemaError> {
        Ok(self.resolve(handle)?.parent)
    }

    /// Context tag of a handle.
    pub fn tag(&self, handle: PropertyHandle) -> Result<u32, SchemaError> {
        Ok(self.resolve(handle)?.tag)
    }

    /// Child of `parent` carrying `tag`.
    pub fn find_child(
        &self,
        parent: PropertyHandle,
        tag: u32,
    ) -> Result<PropertyHandle, SchemaError> {
        self.resolve(parent)?;
        self.children(parent)
            .find(|child| self.properties[child.index()].tag == tag)
            .ok_or(SchemaError::NotFound { parent, tag })
    }

    /// Direct children of a handle in handle order.
    pub fn children(&self, parent: PropertyHandle) -> impl Iterator<Item = PropertyHandle> + '_ {
        self.properties
            .iter()
            .enumerate()
            .skip(parent.index() + 1)
            .filter(move |(_, info)| info.parent == parent)
            .map(|(index, _)| PropertyHandle(index as u16))
    }

    /// True if no property names this handle as parent. The root is never
    /// a leaf.
    pub fn is_leaf(&self, handle: PropertyHandle) -> bool {
        !handle.is_root()
            && handle.index() < self.properties.len()
            && self.children(handle).next().is_none()
    }

    /// True if `ancestor` lies strictly above `descendant`.
    pub fn is_ancestor(&self, ancestor: PropertyHandle, descendant: PropertyHandle) -> bool {
        self.ancestors(descendant).any(|h| h == ancestor)
    }

    /// Strict ancestors of a handle, nearest first, ending at the root.
    pub fn ancestors(&self, handle: PropertyHandle) -> Ancestors<'_> {
        Ancestors {
            schema: self,
            current: handle,
        }
    }

    /// Number of steps from the root.
    pub fn depth(&self, handle: PropertyHandle) -> Result<usize, SchemaError> {
        self.resolve(handle)?;
        Ok(self.ancestors(handle).count())
    }

    /// Depth of the deepest property.
    pub fn tree_depth(&self) -> usize {
        (0..self.properties.len())
            .map(|i| self.ancestors(PropertyHandle(i as u16)).count())
            .max()
            .unwrap_or(0)
    }

    /// Deepest handle that is `a`, `b`, or an ancestor of both.
    pub fn lowest_common_ancestor(
        &self,
        a: PropertyHandle,
        b: PropertyHandle,
    ) -> Result<PropertyHandle, SchemaError> {
        self.resolve(a)?;
        self.resolve(b)?;
        let mut chain_a: Vec<PropertyHandle> = vec![a];
        chain_a.extend(self.ancestors(a));
        std::iter::once(b)
            .chain(self.ancestors(b))
            .find(|h| chain_a.contains(h))
            .ok_or(SchemaError::UnknownHandle(b))
    }

    /// Descendant leaves of `handle` in handle order; a leaf yields itself.
    pub fn for_each_leaf_under(&self, handle: PropertyHandle) -> Result<LeafIter<'_>, SchemaError> {
        self.resolve(handle)?;
        Ok(LeafIter {
            schema: self,
            subtree: handle,
            next: handle.index(),
        })
    }

    // =========================================================================
    // FLAGS
    // =========================================================================

    /// Optional properties may be absent. The root is always present.
    pub fn is_optional(&self, handle: PropertyHandle) -> bool {
        !handle.is_root() && self.optional.contains(handle)
    }

    /// Nullable properties accept `Null`. The root is never null.
    pub fn is_nullable(&self, handle: PropertyHandle) -> bool {
        !handle.is_root() && self.nullable.contains(handle)
    }

    /// Dictionary properties are keyed by element keys on the wire.
    pub fn is_dictionary(&self, handle: PropertyHandle) -> bool {
        !handle.is_root() && self.dictionary.contains(handle)
    }

    /// Ephemeral properties are never persisted by sinks.
    pub fn is_ephemeral(&self, handle: PropertyHandle) -> bool {
        self.ephemeral.contains(handle)
    }

    /// True if some strict ancestor is a dictionary.
    pub fn is_in_dictionary(&self, handle: PropertyHandle) -> bool {
        self.ancestors(handle).any(|h| self.is_dictionary(h))
    }

    // =========================================================================
    // VALUES
    // =========================================================================

    /// Declared value type of a leaf.
    pub fn leaf_type(&self, handle: PropertyHandle) -> Result<TypeTag, SchemaError> {
        self.resolve(handle)?;
        if !self.is_leaf(handle) {
            return Err(SchemaError::NotALeaf(handle));
        }
        self.leaf_types
            .get(handle.index())
            .copied()
            .flatten()
            .ok_or(SchemaError::MissingLeafType(handle))
    }

    /// Checks a value against a leaf's type and nullability.
    pub fn validate_value(
        &self,
        handle: PropertyHandle,
        value: &PropertyValue,
    ) -> Result<(), SchemaError> {
        let expected = self.leaf_type(handle)?;
        match value.type_tag() {
            None if self.is_nullable(handle) => Ok(()),
            None => Err(SchemaError::NullNotAllowed(handle)),
            Some(found) if found == expected => Ok(()),
            Some(found) => Err(SchemaError::TypeMismatch {
                handle,
                expected,
                found,
            }),
        }
    }

    // =========================================================================
    // PATHS
    // =========================================================================

    /// Path from the root to `handle`.
    ///
    /// Fails with `MissingElementKey` if the handle sits inside a
    /// dictionary element, since the key cannot be inferred.
    pub fn path_to(&self, handle: PropertyHandle) -> Result<PropertyPath, SchemaError> {
        self.resolve(handle)?;
        if let Some(dict) = self.ancestors(handle).find(|h| self.is_dictionary(*h)) {
            return Err(SchemaError::MissingElementKey(dict));
        }
        let mut chain: Vec<PropertyHandle> = std::iter::once(handle)
            .chain(self.ancestors(handle))
            .filter(|h| !h.is_root())
            .collect();
        chain.reverse();
        Ok(PropertyPath::from_elements(
            chain.into_iter().map(PathElement::Property).collect(),
        ))
    }

    /// Walks a path against the tree and returns the deepest handle.
    ///
    /// Element keys must follow dictionary handles and nothing else.
    pub fn check_path(&self, path: &PropertyPath) -> Result<PropertyHandle, SchemaError> {
        let mut current = PropertyHandle::ROOT;
        let mut awaiting_key = false;
        for element in path.elements() {
            match *element {
                PathElement::Property(handle) => {
                    if awaiting_key {
                        return Err(SchemaError::MissingElementKey(current));
                    }
                    let info = self.resolve(handle)?;
                    if handle.is_root() || info.parent != current {
                        return Err(SchemaError::InvalidPath(format!(
                            "{} is not a child of {}",
                            handle, current
                        )));
                    }
                    current = handle;
                    awaiting_key = self.is_dictionary(handle);
                }
                PathElement::Element(ElementKey(key)) => {
                    if !awaiting_key {
                        return Err(SchemaError::InvalidPath(format!(
                            "element key {} after non-dictionary {}",
                            key, current
                        )));
                    }
                    awaiting_key = false;
                }
            }
        }
        Ok(current)
    }

    /// Like [`check_path`](Self::check_path) but requires a complete leaf
    /// path (dictionary leaves need their element key).
    pub fn check_leaf_path(&self, path: &PropertyPath) -> Result<PropertyHandle, SchemaError> {
        let handle = self.check_path(path)?;
        if !self.is_leaf(handle) {
            return Err(SchemaError::NotALeaf(handle));
        }
        if self.ends_at_container(path, handle) {
            return Err(SchemaError::MissingElementKey(handle));
        }
        Ok(handle)
    }

    /// Expands a path to every leaf path beneath it.
    ///
    /// Dictionary element keys are not part of the schema, so `keys` is
    /// asked for the live keys of each dictionary container reached.
    pub fn expand_to_leaves<F>(
        &self,
        path: &PropertyPath,
        mut keys: F,
    ) -> Result<Vec<PropertyPath>, SchemaError>
    where
        F: FnMut(&PropertyPath) -> Vec<ElementKey>,
    {
        let handle = self.check_path(path)?;
        let mut out = Vec::new();
        self.expand_into(path.clone(), handle, &mut keys, &mut out);
        Ok(out)
    }

    fn expand_into<F>(
        &self,
        path: PropertyPath,
        handle: PropertyHandle,
        keys: &mut F,
        out: &mut Vec<PropertyPath>,
    ) where
        F: FnMut(&PropertyPath) -> Vec<ElementKey>,
    {
        if self.ends_at_container(&path, handle) {
            for key in keys(&path) {
                self.expand_into(path.element(key), handle, keys, out);
            }
            return;
        }
        if self.is_leaf(handle) {
            out.push(path);
            return;
        }
        for child in self.children(handle) {
            self.expand_into(path.child(child), child, keys, out);
        }
    }

    fn ends_at_container(&self, path: &PropertyPath, handle: PropertyHandle) -> bool {
        self.is_dictionary(handle) && matches!(path.last(), Some(PathElement::Property(_)))
    }
}

/// Strict ancestors of a handle, nearest first.
#[derive(Debug, Clone)]
pub struct Ancestors<'a> {
    schema: &'a TraitSchema,
    current: PropertyHandle,
}

impl Iterator for Ancestors<'_> {
    type Item = PropertyHandle;

    fn next(&mut self) -> Option<PropertyHandle> {
        if self.current.is_root() {
            return None;
        }
        let parent = self.schema.properties.get(self.current.index())?.parent;
        // Unvalidated tables may loop; stop on any non-decreasing step.
        if parent.index() >= self.current.index() {
            self.current = PropertyHandle::ROOT;
            return None;
        }
        self.current = parent;
        Some(parent)
    }
}

/// Lazy traversal of the leaves under one handle.
///
/// Cloning restarts from the clone point; the walk never allocates.
#[derive(Debug, Clone)]
pub struct LeafIter<'a> {
    schema: &'a TraitSchema,
    subtree: PropertyHandle,
    next: usize,
}

impl Iterator for LeafIter<'_> {
    type Item = PropertyHandle;

    fn next(&mut self) -> Option<PropertyHandle> {
        while self.next < self.schema.properties.len() {
            let handle = PropertyHandle(self.next as u16);
            self.next += 1;
            let in_subtree = handle == self.subtree || self.schema.is_ancestor(self.subtree, handle);
            if in_subtree && self.schema.is_leaf(handle) {
                return Some(handle);
            }
        }
        None
    }
}

// =============================================================================
// BUILDER
// =============================================================================

/// Builds an owned [`TraitSchema`] one property at a time.
#[derive(Debug, Clone)]
pub struct SchemaBuilder {
    profile_id: ProfileId,
    properties: Vec<PropertyInfo>,
    leaf_types: Vec<Option<TypeTag>>,
    optional: HandleSet,
    nullable: HandleSet,
    dictionary: HandleSet,
    ephemeral: HandleSet,
    min_version: SchemaVersion,
    max_version: SchemaVersion,
    refused: usize,
}

impl SchemaBuilder {
    /// Builder holding only the root, supporting version 1.
    pub fn new(profile_id: ProfileId) -> Self {
        Self {
            profile_id,
            properties: vec![PropertyInfo::ROOT],
            leaf_types: vec![None],
            optional: HandleSet::new(),
            nullable: HandleSet::new(),
            dictionary: HandleSet::new(),
            ephemeral: HandleSet::new(),
            min_version: SchemaVersion(1),
            max_version: SchemaVersion(1),
            refused: 0,
        }
    }

    /// Sets the supported version range.
    pub fn versions(&mut self, min: u16, max: u16) -> &mut Self {
        self.min_version = SchemaVersion(min);
        self.max_version = SchemaVersion(max);
        self
    }

    /// Adds a raw entry and returns its handle.
    ///
    /// Once every handle is taken further entries are refused: the last
    /// handle is returned and [`build`](Self::build) fails with
    /// `TooManyProperties`.
    pub fn property(
        &mut self,
        parent: PropertyHandle,
        tag: u32,
        leaf_type: Option<TypeTag>,
    ) -> PropertyHandle {
        let Ok(index) = u16::try_from(self.properties.len()) else {
            self.refused += 1;
            return PropertyHandle(u16::MAX);
        };
        let handle = PropertyHandle(index);
        self.properties.push(PropertyInfo { parent, tag });
        self.leaf_types.push(leaf_type);
        handle
    }

    /// Adds a struct property.
    pub fn structure(&mut self, parent: PropertyHandle, tag: u32) -> PropertyHandle {
        self.property(parent, tag, None)
    }

    /// Adds a typed leaf.
    pub fn leaf(&mut self, parent: PropertyHandle, tag: u32, ty: TypeTag) -> PropertyHandle {
        self.property(parent, tag, Some(ty))
    }

    /// Adds a dictionary. `element_type` is the value type for dictionaries
    /// of scalars; dictionaries of structs add children instead.
    pub fn dictionary(
        &mut self,
        parent: PropertyHandle,
        tag: u32,
        element_type: Option<TypeTag>,
    ) -> PropertyHandle {
        let handle = self.property(parent, tag, element_type);
        self.dictionary.insert(handle);
        handle
    }

    /// Marks a handle optional.
    pub fn optional(&mut self, handle: PropertyHandle) -> &mut Self {
        self.optional.insert(handle);
        self
    }

    /// Marks a handle nullable.
    pub fn nullable(&mut self, handle: PropertyHandle) -> &mut Self {
        self.nullable.insert(handle);
        self
    }

    /// Marks a handle ephemeral.
    pub fn ephemeral(&mut self, handle: PropertyHandle) -> &mut Self {
        self.ephemeral.insert(handle);
        self
    }

    /// Validates and returns the schema.
    pub fn build(self) -> Result<TraitSchema, SchemaError> {
        if self.refused > 0 {
            return Err(SchemaError::TooManyProperties(self.properties.len() + self.refused));
        }
        let schema = TraitSchema {
            profile_id: self.profile_id,
            properties: Cow::Owned(self.properties),
            leaf_types: Cow::Owned(self.leaf_types),
            optional: self.optional,
            nullable: self.nullable,
            dictionary: self.dictionary,
            ephemeral: self.ephemeral,
            min_version: self.min_version,
            max_version: self.max_version,
        };
        schema.validate()?;
        Ok(schema)
    }
}
