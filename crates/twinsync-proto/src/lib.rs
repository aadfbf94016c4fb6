//! # TwinSync Protocol
//!
//! Wire message definitions and broker topic scheme for twin replication.
//!
//! ## Messages
//!
//! - `TwinRequest`: point-to-point pull of a key's current snapshot
//! - `TwinResponse`: full snapshot, or notice that the key was removed
//! - `TwinUpdate`: fire-and-forget push of a new version (or a removal)
//!
//! ## Topics
//!
//! Topic scheme: `twinsync/v1/{namespace}/{location}/{message_type}`

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod messages;
pub mod topics;

pub use messages::{MessageError, TwinRequest, TwinResponse, TwinUpdate};
pub use topics::{MessageType, TopicScheme};
