//! Bridge from the object registry to the broker transport.

use crate::registry::{ObjectRegistry, RegistryEvent};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use twinsync_core::TwinObject;
use twinsync_proto::{TwinResponse, TwinUpdate};
use twinsync_transport::{BrokerTransport, RequestHandler, TransportError};

/// Knobs deciding whether a change is pushed as a patch or a snapshot.
///
/// This is a bandwidth policy, not a correctness requirement: subscribers
/// handle either form.
#[derive(Debug, Clone)]
pub struct PushPolicy {
    /// Payloads at most this large are always pushed as full snapshots
    pub small_payload_bytes: usize,
    /// Patches are only worth computing for at least this many sessions
    pub min_sessions_for_patch: usize,
}

impl Default for PushPolicy {
    fn default() -> Self {
        Self {
            small_payload_bytes: 512,
            min_sessions_for_patch: 2,
        }
    }
}

/// Serves pull requests from the registry and broadcasts push updates on
/// registry change events.
pub struct TwinPublisher {
    registry: Arc<ObjectRegistry>,
    transport: Arc<dyn BrokerTransport>,
    policy: PushPolicy,
}

impl TwinPublisher {
    /// Create a publisher over a registry and transport.
    #[must_use]
    pub fn new(
        registry: Arc<ObjectRegistry>,
        transport: Arc<dyn BrokerTransport>,
        policy: PushPolicy,
    ) -> Self {
        Self {
            registry,
            transport,
            policy,
        }
    }

    /// Register the pull handler with the transport.
    ///
    /// Pull responses are always full snapshots at the current version; an
    /// absent key answers `Removed`.
    ///
    /// # Errors
    ///
    /// Returns error if the transport cannot establish the request
    /// subscription.
    pub async fn start(&self) -> Result<(), TransportError> {
        let registry = Arc::clone(&self.registry);
        let handler: RequestHandler = Arc::new(move |request| {
            registry.record_session(&request.key, request.session_id);
            match registry.get(&request.key) {
                Some(object) => {
                    tracing::debug!(
                        key = %request.key,
                        version = object.version,
                        requester_version = request.last_known_version,
                        "Serving pull request"
                    );
                    TwinResponse::Snapshot(object)
                }
                None => TwinResponse::Removed { key: request.key },
            }
        });

        self.transport.serve(handler).await
    }

    /// Consume registry events and broadcast push updates until cancelled.
    pub async fn run(
        self,
        mut events: mpsc::UnboundedReceiver<RegistryEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::info!("Publisher shutting down");
                    break;
                }
                event = events.recv() => {
                    match event {
                        Some(event) => self.handle_event(event).await,
                        None => break,
                    }
                }
            }
        }
    }

    async fn handle_event(&self, event: RegistryEvent) {
        let update = match event {
            RegistryEvent::Changed(key) => {
                // The entry may already be gone if a deregister raced the
                // notification; the Removed event will follow.
                let Some(snapshot) = self.registry.get(&key) else {
                    return;
                };
                TwinUpdate::Object(self.choose_update(snapshot))
            }
            RegistryEvent::Removed(key) => TwinUpdate::Removed { key },
        };

        // Fire-and-forget: a lost push is recovered by subscriber-side gap
        // detection, never by publisher retries.
        if let Err(err) = self.transport.publish_update(&update).await {
            tracing::warn!(key = %update.key(), error = %err, "Failed to publish twin update");
        }
    }

    /// Apply the push policy to a changed key's current snapshot.
    fn choose_update(&self, snapshot: TwinObject) -> TwinObject {
        if snapshot.payload.len() <= self.policy.small_payload_bytes {
            return snapshot;
        }
        if self.registry.session_count(&snapshot.key) < self.policy.min_sessions_for_patch {
            return snapshot;
        }

        let Some(patch) = self.registry.latest_patch(&snapshot.key) else {
            return snapshot;
        };
        if patch.payload.len() >= snapshot.payload.len() {
            return snapshot;
        }

        TwinObject::patch(
            snapshot.key,
            patch.base_version,
            snapshot.version,
            patch.payload,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use twinsync_core::{JsonDiffEngine, TwinKey};
    use twinsync_proto::TwinRequest;
    use twinsync_transport::InMemoryBroker;
    use uuid::Uuid;

    fn large_payload(x: u64) -> Vec<u8> {
        let padding = "p".repeat(2048);
        format!(r#"{{"x":{x},"padding":"{padding}"}}"#).into_bytes()
    }

    fn setup() -> (
        Arc<ObjectRegistry>,
        mpsc::UnboundedReceiver<RegistryEvent>,
        InMemoryBroker,
        TwinPublisher,
    ) {
        let (registry, events) = ObjectRegistry::new(Some(Arc::new(JsonDiffEngine::new())));
        let registry = Arc::new(registry);
        let broker = InMemoryBroker::new();
        let publisher = TwinPublisher::new(
            Arc::clone(&registry),
            Arc::new(broker.clone()),
            PushPolicy::default(),
        );
        (registry, events, broker, publisher)
    }

    #[tokio::test]
    async fn pull_returns_snapshot_or_removed() {
        let (registry, _events, broker, publisher) = setup();
        publisher.start().await.unwrap();

        let key = TwinKey::global("alpha");
        registry.publish(&key, br#"{"x":1}"#.to_vec());

        let session_id = Uuid::new_v4();
        let response = broker
            .request(TwinRequest::new(key.clone(), session_id, 0), Duration::from_secs(1))
            .await
            .unwrap();
        let TwinResponse::Snapshot(object) = response else {
            panic!("expected snapshot");
        };
        assert_eq!(object.version, 1);
        assert!(!object.is_patch);
        assert_eq!(registry.session_count(&key), 1);

        let response = broker
            .request(
                TwinRequest::new(TwinKey::global("missing"), session_id, 0),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert!(matches!(response, TwinResponse::Removed { .. }));
    }

    #[tokio::test]
    async fn change_events_become_push_updates() {
        let (registry, events, broker, publisher) = setup();
        let key = TwinKey::global("alpha");
        let mut updates = broker.subscribe_updates(&key).await.unwrap();

        let cancel = CancellationToken::new();
        let run = tokio::spawn(publisher.run(events, cancel.clone()));

        registry.publish(&key, br#"{"x":1}"#.to_vec());
        let update = updates.recv().await.unwrap();
        assert!(matches!(update, TwinUpdate::Object(obj) if obj.version == 1 && !obj.is_patch));

        registry.deregister(&key);
        let update = updates.recv().await.unwrap();
        assert!(matches!(update, TwinUpdate::Removed { .. }));

        cancel.cancel();
        run.await.unwrap();
    }

    #[tokio::test]
    async fn small_payloads_push_snapshots() {
        let (registry, _events, _broker, publisher) = setup();
        let key = TwinKey::global("alpha");

        registry.publish(&key, br#"{"x":1}"#.to_vec());
        registry.publish(&key, br#"{"x":2}"#.to_vec());

        let chosen = publisher.choose_update(registry.get(&key).unwrap());
        assert!(!chosen.is_patch);
    }

    #[tokio::test]
    async fn large_payload_with_sessions_pushes_patch() {
        let (registry, _events, _broker, publisher) = setup();
        let key = TwinKey::global("alpha");

        registry.publish(&key, large_payload(1));
        registry.record_session(&key, Uuid::new_v4());
        registry.record_session(&key, Uuid::new_v4());
        registry.publish(&key, large_payload(2));

        let chosen = publisher.choose_update(registry.get(&key).unwrap());
        assert!(chosen.is_patch);
        assert_eq!(chosen.base_version, Some(1));
        assert_eq!(chosen.version, 2);
        assert!(chosen.payload.len() < large_payload(2).len());
    }

    #[tokio::test]
    async fn too_few_sessions_pushes_snapshot() {
        let (registry, _events, _broker, publisher) = setup();
        let key = TwinKey::global("alpha");

        registry.publish(&key, large_payload(1));
        registry.record_session(&key, Uuid::new_v4());
        registry.publish(&key, large_payload(2));

        let chosen = publisher.choose_update(registry.get(&key).unwrap());
        assert!(!chosen.is_patch);
    }
}
