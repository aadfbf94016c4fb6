//! # TwinSync Publisher
//!
//! Publisher-side components: the authoritative [`ObjectRegistry`] holding
//! the current value and version of every published key, and the
//! [`TwinPublisher`] bridging it to the broker transport — answering pull
//! requests with full snapshots and broadcasting push updates on change.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod publisher;
pub mod registry;

pub use publisher::{PushPolicy, TwinPublisher};
pub use registry::{ObjectRegistry, RegistryEvent};
