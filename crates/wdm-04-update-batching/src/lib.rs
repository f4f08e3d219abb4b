//! # WDM-04 Update Batching & Conflict Resolution
//!
//! Tracks which parts of a trait changed locally and turns them into
//! minimal, versioned update batches.
//!
//! **Subsystem ID:** 04  
//! **Architecture:** Domain library + batcher service
//!
//! ## Rules
//!
//! | Rule | Effect |
//! |------|--------|
//! | Ancestor already dirty | mark is a no-op for path count |
//! | Descendants dirty | superseded by the new ancestor path |
//! | All children of a struct dirty | collapse into the struct |
//! | Budget exceeded | collapse into the whole trait |
//! | Base version differs | `VersionConflict { current }` |

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod domain;
pub mod service;

pub use config::BatchingConfig;
pub use domain::{
    check_base_version, BatchError, DirtyEntry, DirtySet, ElementChange, FlushOutcome,
    FlushTicket, MarkOutcome, PreparedUpdate,
};
pub use service::UpdateBatcher;
