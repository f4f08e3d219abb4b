//! # Adapters Layer (Hexagonal Architecture)
//!
//! In-memory implementation of the application data ports.

mod memory;

pub use memory::MemoryTraitData;
