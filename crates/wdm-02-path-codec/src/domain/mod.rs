//! # Domain Module
//!
//! Wire-level path shapes, version tags and codec errors.

pub mod errors;
pub mod wire;

pub use errors::*;
pub use wire::*;
