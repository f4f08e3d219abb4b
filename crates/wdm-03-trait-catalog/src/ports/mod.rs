//! # Ports Layer
//!
//! Application data ports. The application implements them; WDM calls them.

pub mod outbound;

pub use outbound::*;
