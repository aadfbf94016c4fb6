//! In-process broker for tests and single-process embedding.
//!
//! Routes requests directly to the registered handler and fans updates out
//! over per-subscriber channels. An outage mode (`set_available(false)`)
//! makes pulls time out and silently drops pushes, which is exactly how a
//! real broker outage presents to the protocol.

use crate::{BrokerTransport, RequestHandler, TransportError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use twinsync_core::TwinKey;
use twinsync_proto::{TwinRequest, TwinResponse, TwinUpdate};

/// Per-key buffer for pushes racing ahead of the consumer.
const UPDATE_CHANNEL_CAPACITY: usize = 64;

/// Channel-backed broker shared by publisher and subscribers in one process.
///
/// Clones share the same broker state.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    handler: Mutex<Option<RequestHandler>>,
    subscribers: Mutex<HashMap<TwinKey, Vec<mpsc::Sender<TwinUpdate>>>>,
    available: AtomicBool,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    /// Create a new broker in the available state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                handler: Mutex::new(None),
                subscribers: Mutex::new(HashMap::new()),
                available: AtomicBool::new(true),
            }),
        }
    }

    /// Toggle the simulated broker outage.
    ///
    /// While unavailable, pulls fail with `Timeout` and pushes are dropped.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    fn is_available(&self) -> bool {
        self.inner.available.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrokerTransport for InMemoryBroker {
    async fn request(
        &self,
        request: TwinRequest,
        _timeout: Duration,
    ) -> Result<TwinResponse, TransportError> {
        if !self.is_available() {
            return Err(TransportError::Timeout);
        }

        let handler = self.inner.handler.lock().expect("handler lock").clone();
        let Some(handler) = handler else {
            return Err(TransportError::Unavailable("no publisher serving".to_string()));
        };

        Ok(handler(request))
    }

    async fn publish_update(&self, update: &TwinUpdate) -> Result<(), TransportError> {
        if !self.is_available() {
            // Fire-and-forget: an outage loses pushes, subscribers recover
            // through gap detection.
            return Ok(());
        }

        let mut subscribers = self.inner.subscribers.lock().expect("subscribers lock");
        if let Some(senders) = subscribers.get_mut(update.key()) {
            senders.retain(|sender| match sender.try_send(update.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(key = %update.key(), "Subscriber update buffer full, dropping push");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
        }

        Ok(())
    }

    async fn subscribe_updates(
        &self,
        key: &TwinKey,
    ) -> Result<mpsc::Receiver<TwinUpdate>, TransportError> {
        let (tx, rx) = mpsc::channel(UPDATE_CHANNEL_CAPACITY);
        self.inner
            .subscribers
            .lock()
            .expect("subscribers lock")
            .entry(key.clone())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn unsubscribe_updates(&self, key: &TwinKey) -> Result<(), TransportError> {
        let mut subscribers = self.inner.subscribers.lock().expect("subscribers lock");
        if let Some(senders) = subscribers.get_mut(key) {
            senders.retain(|sender| !sender.is_closed());
            if senders.is_empty() {
                subscribers.remove(key);
            }
        }
        Ok(())
    }

    async fn serve(&self, handler: RequestHandler) -> Result<(), TransportError> {
        *self.inner.handler.lock().expect("handler lock") = Some(handler);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use twinsync_core::TwinObject;
    use uuid::Uuid;

    fn snapshot_response(request: TwinRequest) -> TwinResponse {
        TwinResponse::Snapshot(TwinObject::snapshot(request.key, 1, b"{}".to_vec()))
    }

    #[tokio::test]
    async fn request_without_publisher_is_unavailable() {
        let broker = InMemoryBroker::new();
        let request = TwinRequest::new(TwinKey::global("alpha"), Uuid::new_v4(), 0);

        let err = broker
            .request(request, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Unavailable(_)));
    }

    #[tokio::test]
    async fn request_routes_to_handler() {
        let broker = InMemoryBroker::new();
        broker.serve(Arc::new(snapshot_response)).await.unwrap();

        let request = TwinRequest::new(TwinKey::global("alpha"), Uuid::new_v4(), 0);
        let response = broker.request(request, Duration::from_secs(1)).await.unwrap();

        assert!(matches!(response, TwinResponse::Snapshot(obj) if obj.version == 1));
    }

    #[tokio::test]
    async fn updates_fan_out_to_subscribers() {
        let broker = InMemoryBroker::new();
        let key = TwinKey::global("alpha");

        let mut rx_a = broker.subscribe_updates(&key).await.unwrap();
        let mut rx_b = broker.subscribe_updates(&key).await.unwrap();

        let update = TwinUpdate::Object(TwinObject::snapshot(key.clone(), 1, b"{}".to_vec()));
        broker.publish_update(&update).await.unwrap();

        assert_eq!(rx_a.recv().await.unwrap(), update);
        assert_eq!(rx_b.recv().await.unwrap(), update);
    }

    #[tokio::test]
    async fn outage_times_out_pulls_and_drops_pushes() {
        let broker = InMemoryBroker::new();
        broker.serve(Arc::new(snapshot_response)).await.unwrap();
        let key = TwinKey::global("alpha");
        let mut rx = broker.subscribe_updates(&key).await.unwrap();

        broker.set_available(false);

        let request = TwinRequest::new(key.clone(), Uuid::new_v4(), 0);
        let err = broker
            .request(request, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout));

        let update = TwinUpdate::Object(TwinObject::snapshot(key.clone(), 1, b"{}".to_vec()));
        broker.publish_update(&update).await.unwrap();

        broker.set_available(true);
        let update = TwinUpdate::Object(TwinObject::snapshot(key, 2, b"{}".to_vec()));
        broker.publish_update(&update).await.unwrap();

        // Only the post-outage push arrives.
        let received = rx.recv().await.unwrap();
        assert!(matches!(received, TwinUpdate::Object(obj) if obj.version == 2));
    }
}
