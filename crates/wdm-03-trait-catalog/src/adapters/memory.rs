//! In-memory trait data.
//!
//! Implements both `TraitSource` and `TraitSink` over a sorted map of leaf
//! values. Suitable for tests and for embedders whose trait data fits in
//! memory.

use crate::ports::outbound::{DataError, PropertyReader, TraitSink, TraitSource};
use parking_lot::RwLock;
use shared_types::{DataVersion, ElementKey, PropertyValue};
use std::collections::BTreeMap;
use tracing::debug;
use wdm_01_property_schema::{ChangeSet, PathElement, PathValue, PropertyPath};

#[derive(Debug, Default)]
struct MemoryState {
    values: BTreeMap<PropertyPath, PropertyValue>,
    version: DataVersion,
    applied: Option<DataVersion>,
    read_only: bool,
}

impl MemoryState {
    fn apply(&mut self, changes: &ChangeSet) {
        self.values.retain(|path, _| !changes.replaces(path));
        for pair in &changes.values {
            self.values.insert(pair.path.clone(), pair.value.clone());
        }
    }
}

/// Trait data held in memory.
#[derive(Debug, Default)]
pub struct MemoryTraitData {
    state: RwLock<MemoryState>,
}

impl MemoryTraitData {
    /// Empty data at version 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Data seeded with values at a given version.
    pub fn with_values(version: DataVersion, values: Vec<PathValue>) -> Self {
        let data = Self::new();
        {
            let mut state = data.state.write();
            state.version = version;
            for pair in values {
                state.values.insert(pair.path, pair.value);
            }
        }
        data
    }

    /// Value at a path, if present.
    pub fn get(&self, path: &PropertyPath) -> Option<PropertyValue> {
        self.state.read().values.get(path).cloned()
    }

    /// Copy of every stored leaf.
    pub fn snapshot(&self) -> BTreeMap<PropertyPath, PropertyValue> {
        self.state.read().values.clone()
    }

    /// Sets a leaf without bumping the version.
    pub fn set(&self, path: PropertyPath, value: impl Into<PropertyValue>) {
        self.state.write().values.insert(path, value.into());
    }

    /// Removes every leaf at or below `path` without bumping the version.
    pub fn remove(&self, path: &PropertyPath) {
        self.state.write().values.retain(|p, _| !path.covers(p));
    }

    /// Publisher-side local mutation: writes the values and bumps the
    /// version once for the whole batch.
    pub fn commit(&self, values: Vec<PathValue>) -> DataVersion {
        let mut state = self.state.write();
        for pair in values {
            state.values.insert(pair.path, pair.value);
        }
        state.version = state.version.next();
        state.version
    }

    /// Makes every subsequent batch write fail with `Rejected`.
    pub fn set_read_only(&self, read_only: bool) {
        self.state.write().read_only = read_only;
    }
}

impl PropertyReader for MemoryTraitData {
    fn read_property(&self, path: &PropertyPath) -> Result<PropertyValue, DataError> {
        self.get(path)
            .ok_or_else(|| DataError::NotPresent(path.clone()))
    }

    fn element_keys(&self, dictionary: &PropertyPath) -> Vec<ElementKey> {
        let state = self.state.read();
        let depth = dictionary.len();
        let mut keys: Vec<ElementKey> = state
            .values
            .range(dictionary.clone()..)
            .take_while(|(path, _)| dictionary.covers(path))
            .filter_map(|(path, _)| match path.elements().get(depth) {
                Some(PathElement::Element(key)) => Some(*key),
                _ => None,
            })
            .collect();
        keys.dedup();
        keys
    }
}

impl TraitSource for MemoryTraitData {
    fn version(&self) -> DataVersion {
        self.state.read().version
    }

    fn write_properties(&self, changes: &ChangeSet) -> Result<DataVersion, DataError> {
        let mut state = self.state.write();
        if state.read_only {
            return Err(DataError::Rejected("read-only".to_string()));
        }
        state.apply(changes);
        state.version = state.version.next();
        debug!(
            version = state.version.0,
            pairs = changes.values.len(),
            "Applied update batch"
        );
        Ok(state.version)
    }
}

impl TraitSink for MemoryTraitData {
    fn applied_version(&self) -> Option<DataVersion> {
        self.state.read().applied
    }

    fn write_property(&self, path: &PropertyPath, value: PropertyValue) -> Result<(), DataError> {
        self.state.write().values.insert(path.clone(), value);
        Ok(())
    }

    fn apply_notify(&self, version: DataVersion, changes: &ChangeSet) -> Result<(), DataError> {
        let mut state = self.state.write();
        if state.read_only {
            return Err(DataError::Rejected("read-only".to_string()));
        }
        state.apply(changes);
        state.applied = Some(version);
        Ok(())
    }
}
