//! # Schema Registry
//!
//! Process-wide map from profile id to validated schema. Schemas are
//! registered once at startup and shared read-only afterwards.

use crate::domain::{SchemaError, TraitSchema};
use parking_lot::RwLock;
use shared_types::ProfileId;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Registry of trait schemas keyed by profile.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    schemas: RwLock<HashMap<ProfileId, Arc<TraitSchema>>>,
}

impl SchemaRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates and registers a schema.
    pub fn register(&self, schema: TraitSchema) -> Result<Arc<TraitSchema>, SchemaError> {
        schema.validate()?;
        let profile = schema.profile_id();
        let mut schemas = self.schemas.write();
        if schemas.contains_key(&profile) {
            return Err(SchemaError::DuplicateProfile(profile));
        }
        let schema = Arc::new(schema);
        schemas.insert(profile, Arc::clone(&schema));
        info!(
            profile = profile.0,
            properties = schema.len(),
            min_version = schema.min_version().0,
            max_version = schema.max_version().0,
            "Registered trait schema"
        );
        Ok(schema)
    }

    /// Schema for a profile.
    pub fn get(&self, profile: ProfileId) -> Result<Arc<TraitSchema>, SchemaError> {
        let found = self.schemas.read().get(&profile).cloned();
        if found.is_none() {
            debug!(profile = profile.0, "Schema lookup miss");
        }
        found.ok_or(SchemaError::UnknownProfile(profile))
    }

    /// True if a schema is registered for the profile.
    pub fn contains(&self, profile: ProfileId) -> bool {
        self.schemas.read().contains_key(&profile)
    }

    /// Number of registered schemas.
    pub fn len(&self) -> usize {
        self.schemas.read().len()
    }

    /// True if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.schemas.read().is_empty()
    }
}
