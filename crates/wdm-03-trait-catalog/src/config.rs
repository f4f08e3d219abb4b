//! # Catalog Configuration

use serde::{Deserialize, Serialize};

/// Trait catalog configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Maximum number of live trait instances.
    pub max_instances: usize,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self { max_instances: 256 }
    }
}

impl CatalogConfig {
    /// Create a config for testing (small capacity).
    pub fn for_testing() -> Self {
        Self { max_instances: 8 }
    }
}
