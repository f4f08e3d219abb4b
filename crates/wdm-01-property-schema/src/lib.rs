//! # WDM-01 Property Schema Engine
//!
//! Maps a trait's flat property tree to typed, nullable, versioned fields.
//!
//! **Subsystem ID:** 01  
//! **Architecture:** Domain library (no ports; pure queries over tables)
//!
//! ## Purpose
//!
//! Every other subsystem talks about trait data in terms of property
//! handles. This crate answers the structural questions about them:
//!
//! | Query | Cost |
//! |-------|------|
//! | `resolve(handle)` | O(1) |
//! | `find_child(parent, tag)` | O(n) scan of later entries |
//! | `is_optional` / `is_nullable` | O(1) bit test |
//! | `for_each_leaf_under(handle)` | lazy, restartable |
//!
//! ## Module Structure
//!
//! ```text
//! wdm-01-property-schema/
//! ├── domain/          # TraitSchema, HandleSet, PropertyPath, errors, invariants
//! ├── registry.rs      # SchemaRegistry (profile -> Arc<TraitSchema>)
//! └── fixtures.rs      # Static example schemas
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod domain;
pub mod fixtures;
pub mod registry;

pub use domain::{
    Ancestors, ChangeSet, HandleSet, LeafIter, PathElement, PathValue, PropertyInfo,
    PropertyPath, SchemaBuilder, SchemaError, SchemaTables, TraitSchema,
};
pub use registry::SchemaRegistry;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
