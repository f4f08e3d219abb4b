//! # Domain Layer
//!
//! Subscription states, the transition table, events and errors.

pub mod entities;
pub mod errors;
pub mod events;
pub mod state;

pub use entities::*;
pub use errors::*;
pub use events::*;
pub use state::*;
