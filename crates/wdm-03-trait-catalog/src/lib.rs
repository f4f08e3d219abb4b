//! # WDM-03 Trait Catalog
//!
//! Resolves wire addresses to live trait instances.
//!
//! **Subsystem ID:** 03  
//! **Architecture:** Hexagonal (DDD + Ports/Adapters)
//!
//! ## Purpose
//!
//! Maps `(profile, resource, instance)` to a generation-checked
//! [`CatalogHandle`] and from there to the application's [`TraitSource`]
//! or [`TraitSink`]. The catalog never owns application objects; it holds
//! weak references and reports `BindingDropped` when they are gone.
//!
//! ## Module Structure
//!
//! ```text
//! wdm-03-trait-catalog/
//! ├── domain/          # CatalogHandle, TraitBinding, CatalogEntry, errors
//! ├── ports/           # TraitSource / TraitSink / PropertyReader
//! ├── adapters/        # MemoryTraitData
//! ├── service.rs       # TraitCatalog, CatalogSnapshot
//! └── config.rs        # CatalogConfig
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod adapters;
pub mod config;
pub mod domain;
pub mod ports;
pub mod service;

pub use adapters::MemoryTraitData;
pub use config::CatalogConfig;
pub use domain::{CatalogEntry, CatalogError, CatalogHandle, TraitBinding};
pub use ports::{DataError, PropertyReader, TraitSink, TraitSource};
pub use service::{CatalogSnapshot, TraitCatalog};
