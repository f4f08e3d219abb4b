//! # Ports Layer (Hexagonal Architecture)
//!
//! - `inbound`: what a peer delivers to this node (`MessageHandler`)
//! - `outbound`: the exchange layer this node sends through (`Transport`)

pub mod inbound;
pub mod outbound;

pub use inbound::*;
pub use outbound::*;
