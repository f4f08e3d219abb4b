//! # Adapters Layer (Hexagonal Architecture)
//!
//! Implements the `BinaryCodec` port.

mod bincode_codec;

pub use bincode_codec::BincodeCodec;
