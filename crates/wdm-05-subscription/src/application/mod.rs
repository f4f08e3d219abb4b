//! # Application Layer
//!
//! - `client`: the subscriber state machine
//! - `publisher`: serves subscriptions and updates for local sources

pub mod client;
pub mod publisher;

pub use client::{CancelHandle, SubscriptionClient};
pub use publisher::PublisherService;
