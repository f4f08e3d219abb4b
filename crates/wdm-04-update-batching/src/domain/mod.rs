//! # Domain Module
//!
//! Dirty sets, flush tickets and the base-version rule.

pub mod entities;
pub mod errors;
pub mod invariants;

pub use entities::*;
pub use errors::*;
pub use invariants::*;
