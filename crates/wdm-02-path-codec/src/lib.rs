//! # WDM-02 Path/Version Codec
//!
//! Renders schema handles as wire paths and values as typed bytes, and back.
//!
//! **Subsystem ID:** 02  
//! **Architecture:** Hexagonal (outbound `BinaryCodec` port + bincode adapter)
//!
//! ## Flow
//!
//! ```text
//! PropertyPath ──(schema tags)──→ WirePath ──(BinaryCodec)──→ bytes
//! PropertyValue ─(leaf type check)──────────(BinaryCodec)──→ bytes
//! ```
//!
//! Decoding walks `find_child` from the root, so a tag unknown to the local
//! schema is a `SchemaError::NotFound`, never a silent drop.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod adapters;
pub mod domain;
pub mod ports;
pub mod service;

pub use adapters::BincodeCodec;
pub use domain::{CodecError, VersionRange, VersionTag, WireElement, WirePath};
pub use ports::BinaryCodec;
pub use service::{negotiate_version, version_range, PathCodec};

/// Codec used by default across the workspace.
pub type DefaultPathCodec = PathCodec<BincodeCodec>;
