//! # TwinSync Subscriber
//!
//! Subscriber-side components: the durable [`SqliteSessionStore`] recording
//! the last applied version and cached payload per key, and the
//! [`TwinSubscriber`] driving one resolution task per subscribed key —
//! pull-then-push with gap detection, resilient to broker outages and
//! process restarts.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod retry;
pub mod store;
pub mod subscriber;

pub use retry::RetryPolicy;
pub use store::SqliteSessionStore;
pub use subscriber::{RemovedCallback, TwinHandle, TwinSubscriber, TwinSubscriberConfig, UpdateCallback};
