//! # Shared Types Crate
//!
//! Identifiers, typed values and wire message shapes shared by every
//! Weave Data Management subsystem.
//!
//! ## Design Principles
//!
//! - **Single Source of Truth**: all cross-subsystem types are defined here.
//! - **Schema-Free**: nothing in this crate knows about property maps; paths
//!   and values inside messages are opaque codec output.
//! - **Serializable**: every type derives `serde` so adapters can carry it.

pub mod ids;
pub mod messages;
pub mod value;

pub use ids::*;
pub use messages::*;
pub use value::*;
