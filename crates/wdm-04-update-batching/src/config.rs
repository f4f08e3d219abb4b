//! # Batching Configuration

use serde::{Deserialize, Serialize};

/// Update batching configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchingConfig {
    /// Dirty paths per instance before the set collapses to the whole trait.
    pub max_dirty_paths: usize,

    /// Collapse a struct's children into the struct once all are dirty.
    pub coalesce_structs: bool,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            max_dirty_paths: 32,
            coalesce_structs: true,
        }
    }
}

impl BatchingConfig {
    /// Create a config for testing (small path budget).
    pub fn for_testing() -> Self {
        Self {
            max_dirty_paths: 4,
            coalesce_structs: true,
        }
    }
}
