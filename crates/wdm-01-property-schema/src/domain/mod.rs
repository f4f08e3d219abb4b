//! # Domain Module
//!
//! Core types of the Property Schema Engine.

pub mod entities;
pub mod errors;
pub mod handle_set;
pub mod invariants;
pub mod value_objects;

pub use entities::*;
pub use errors::*;
pub use handle_set::*;
pub use invariants::*;
pub use value_objects::*;
