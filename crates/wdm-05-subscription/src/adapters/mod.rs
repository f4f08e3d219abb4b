//! # Adapters Layer (Hexagonal Architecture)
//!
//! In-process implementation of the transport port.

mod loopback;

pub use loopback::LoopbackNetwork;
