//! # TwinSync Transport
//!
//! Broker transport abstraction consumed by the publisher and subscriber.
//!
//! The contract is three capabilities: point-to-point pull
//! (request/response), fire-and-forget push publish, and per-key push
//! subscription. Any broker that can carry those can back TwinSync; this
//! crate ships an MQTT implementation and an in-memory one for tests and
//! single-process embedding.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod memory;
pub mod mqtt;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use twinsync_core::TwinKey;
use twinsync_proto::{TwinRequest, TwinResponse, TwinUpdate};

pub use memory::InMemoryBroker;
pub use mqtt::{MqttTransport, MqttTransportConfig};

/// Publisher-side pull handler: answers each request with a response.
///
/// Handlers must be cheap and non-blocking; the registry lookup they wrap
/// is an in-memory read.
pub type RequestHandler = Arc<dyn Fn(TwinRequest) -> TwinResponse + Send + Sync>;

/// Asynchronous broker transport.
///
/// Push delivery is the transport's natural order and is not guaranteed
/// lossless; reliability is recovered by subscriber-side gap detection.
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Issue a pull request and wait for the matching response.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if no response arrives within `timeout`, or
    /// `Unavailable` if the transport cannot carry the request.
    async fn request(
        &self,
        request: TwinRequest,
        timeout: Duration,
    ) -> Result<TwinResponse, TransportError>;

    /// Broadcast a push update on the key's topic. Fire-and-forget: no
    /// acknowledgment is awaited.
    ///
    /// # Errors
    ///
    /// Returns error if the update cannot be handed to the broker.
    async fn publish_update(&self, update: &TwinUpdate) -> Result<(), TransportError>;

    /// Open the push channel for a key.
    ///
    /// Messages received before the channel is drained are buffered by the
    /// returned receiver in arrival order.
    ///
    /// # Errors
    ///
    /// Returns error if the subscription cannot be established.
    async fn subscribe_updates(
        &self,
        key: &TwinKey,
    ) -> Result<mpsc::Receiver<TwinUpdate>, TransportError>;

    /// Release the push subscription for a key.
    ///
    /// # Errors
    ///
    /// Returns error if the broker rejects the unsubscribe.
    async fn unsubscribe_updates(&self, key: &TwinKey) -> Result<(), TransportError>;

    /// Register the publisher-side pull handler and start serving requests.
    ///
    /// # Errors
    ///
    /// Returns error if the request subscription cannot be established.
    async fn serve(&self, handler: RequestHandler) -> Result<(), TransportError>;
}

/// Errors for transport operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// No response arrived within the request timeout
    #[error("request timed out")]
    Timeout,
    /// The broker connection is down or not serving
    #[error("transport unavailable: {0}")]
    Unavailable(String),
    /// Publish failed
    #[error("publish error: {0}")]
    Publish(String),
    /// Subscription failed
    #[error("subscription error: {0}")]
    Subscribe(String),
    /// Message encoding or decoding failed
    #[error("codec error: {0}")]
    Codec(String),
}
