//! # WDM-05 Subscription State Machine
//!
//! Keeps a subscriber's view of remote trait instances consistent with the
//! publisher's across partial updates, conflicts and reconnects.
//!
//! **Subsystem ID:** 05  
//! **Architecture:** Hexagonal (DDD + Ports/Adapters)
//!
//! ## Module Structure
//!
//! ```text
//! wdm-05-subscription/
//! ├── domain/
//! │   ├── state.rs       # SubscriptionState, transition table, SyncStatus, backoff
//! │   ├── entities.rs    # TrackedInstance, OutboundUpdate, UpdatePipeline
//! │   ├── events.rs      # SubscriptionEvent
//! │   └── errors.rs      # SubscriptionError, TransportError, ErrorClass
//! ├── ports/
//! │   ├── inbound.rs     # MessageHandler
//! │   └── outbound.rs    # Transport
//! ├── adapters/
//! │   └── loopback.rs    # LoopbackNetwork (in-process, fault injection)
//! ├── application/
//! │   ├── client.rs      # SubscriptionClient, CancelHandle
//! │   └── publisher.rs   # PublisherService
//! └── config.rs          # SubscriptionConfig
//! ```
//!
//! ## Error Classes
//!
//! | Class | Examples | Retried |
//! |-------|----------|---------|
//! | Transport | send failure, exchange or liveness timeout | yes, then `Aborting` |
//! | Conflict | stale base version | no, reconciled |
//! | Schema | unknown path, type mismatch, version range | no |
//! | Catalog | stale handle, dropped binding | no |

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod ports;

pub use adapters::LoopbackNetwork;
pub use application::{CancelHandle, PublisherService, SubscriptionClient};
pub use config::SubscriptionConfig;
pub use domain::{
    backoff_delay, ErrorClass, OutboundUpdate, SubscriptionError, SubscriptionEvent,
    SubscriptionState, SubscriptionStateMachine, SyncStatus, TrackedInstance, TransportError,
    UpdatePipeline,
};
pub use ports::{MessageHandler, Transport};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
