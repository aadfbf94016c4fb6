//! # TwinSync Core
//!
//! Object model and reconciliation semantics for TwinSync.
//!
//! This crate provides:
//! - Twin keys and versioned twin objects (full snapshots and patches)
//! - Subscriber session state (last-applied version plus cached payload)
//! - The pure consistency reconciler shared by publisher and subscriber
//! - The pluggable diff/patch collaborator, with a JSON structural engine

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod key;
pub mod object;
pub mod patch;
pub mod reconcile;
pub mod session;

pub use key::TwinKey;
pub use object::TwinObject;
pub use patch::{JsonDiffEngine, PatchEngine, PatchError};
pub use reconcile::{reconcile, Reconciliation};
pub use session::SessionState;
