//! # Value Objects
//!
//! Property paths and the change sets built from them.

use serde::{Deserialize, Serialize};
use shared_types::{ElementKey, PropertyHandle, PropertyValue};
use std::fmt;

/// One step of a property path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PathElement {
    /// Descend into a child property.
    Property(PropertyHandle),
    /// Select an element of the preceding dictionary property.
    Element(ElementKey),
}

/// Ordered handle sequence from the root (exclusive) to a leaf or subtree.
///
/// The empty path addresses the whole trait. Containment is plain prefix
/// matching, so it never needs the schema.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct PropertyPath {
    elements: Vec<PathElement>,
}

impl PropertyPath {
    /// Path addressing the whole trait.
    pub fn root() -> Self {
        Self::default()
    }

    /// Builds a path from raw elements. Use `TraitSchema::check_path` to
    /// validate it against a schema.
    pub fn from_elements(elements: Vec<PathElement>) -> Self {
        Self { elements }
    }

    /// Path extended by a child property.
    #[must_use]
    pub fn child(&self, handle: PropertyHandle) -> Self {
        let mut elements = self.elements.clone();
        elements.push(PathElement::Property(handle));
        Self { elements }
    }

    /// Path extended by a dictionary element key.
    #[must_use]
    pub fn element(&self, key: ElementKey) -> Self {
        let mut elements = self.elements.clone();
        elements.push(PathElement::Element(key));
        Self { elements }
    }

    /// Path with its last element removed; `None` for the root.
    pub fn parent(&self) -> Option<Self> {
        let (_, rest) = self.elements.split_last()?;
        Some(Self {
            elements: rest.to_vec(),
        })
    }

    /// Steps of the path.
    pub fn elements(&self) -> &[PathElement] {
        &self.elements
    }

    /// Last step, if any.
    pub fn last(&self) -> Option<&PathElement> {
        self.elements.last()
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// True for the whole-trait path.
    pub fn is_root(&self) -> bool {
        self.elements.is_empty()
    }

    /// Alias of [`is_root`](Self::is_root) for collection-style callers.
    pub fn is_empty(&self) -> bool {
        self.is_root()
    }

    /// Deepest property handle named by the path; `None` for the root.
    pub fn leaf(&self) -> Option<PropertyHandle> {
        self.elements.iter().rev().find_map(|e| match e {
            PathElement::Property(h) => Some(*h),
            PathElement::Element(_) => None,
        })
    }

    /// Deepest property handle, or the root handle for the root path.
    pub fn handle(&self) -> PropertyHandle {
        self.leaf().unwrap_or(PropertyHandle::ROOT)
    }

    /// True if `other` lies at or below this path.
    pub fn covers(&self, other: &PropertyPath) -> bool {
        other.elements.starts_with(&self.elements)
    }

    /// True if this path lies at or below `other`.
    pub fn is_covered_by(&self, other: &PropertyPath) -> bool {
        other.covers(self)
    }
}

impl fmt::Display for PropertyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.elements.is_empty() {
            return f.write_str("/");
        }
        for element in &self.elements {
            match element {
                PathElement::Property(h) => write!(f, "/{}", h)?,
                PathElement::Element(k) => write!(f, "/[{}]", k.0)?,
            }
        }
        Ok(())
    }
}

/// A leaf path with its value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathValue {
    /// Leaf path.
    pub path: PropertyPath,
    /// Value at that path.
    pub value: PropertyValue,
}

impl PathValue {
    /// Pairs a path with a value.
    pub fn new(path: PropertyPath, value: impl Into<PropertyValue>) -> Self {
        Self {
            path,
            value: value.into(),
        }
    }
}

/// A batch of changes to one trait instance.
///
/// Every path in `scopes` is replaced wholesale: existing values under it
/// are dropped, then `values` are written. A scope equal to the root makes
/// the batch a full-state replacement.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChangeSet {
    /// Subtrees replaced by this batch.
    pub scopes: Vec<PropertyPath>,
    /// Leaf values inside the scopes.
    pub values: Vec<PathValue>,
}

impl ChangeSet {
    /// A batch replacing the whole trait.
    pub fn full_state(values: Vec<PathValue>) -> Self {
        Self {
            scopes: vec![PropertyPath::root()],
            values,
        }
    }

    /// True if the batch replaces the whole trait.
    pub fn is_full_state(&self) -> bool {
        self.scopes.iter().any(PropertyPath::is_root)
    }

    /// True if the batch changes nothing.
    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty() && self.values.is_empty()
    }

    /// True if `path` is inside one of the scopes.
    pub fn replaces(&self, path: &PropertyPath) -> bool {
        self.scopes.iter().any(|scope| scope.covers(path))
    }
}
