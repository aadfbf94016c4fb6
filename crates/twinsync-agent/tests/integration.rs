//! End-to-end publisher/subscriber scenarios over the in-memory broker,
//! plus an MQTT round trip gated behind `TWINSYNC_INTEGRATION=1`.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use twinsync_core::{JsonDiffEngine, TwinKey, TwinObject};
use twinsync_publisher::{ObjectRegistry, PushPolicy, TwinPublisher};
use twinsync_subscriber::{
    RemovedCallback, SqliteSessionStore, TwinSubscriber, TwinSubscriberConfig, UpdateCallback,
};
use twinsync_transport::{BrokerTransport, InMemoryBroker};
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(300);

struct Stack {
    broker: InMemoryBroker,
    registry: Arc<ObjectRegistry>,
    cancel: CancellationToken,
}

impl Drop for Stack {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn start_stack() -> Stack {
    let broker = InMemoryBroker::new();
    let (registry, events) = ObjectRegistry::new(Some(Arc::new(JsonDiffEngine::new())));
    let registry = Arc::new(registry);

    let publisher = TwinPublisher::new(
        Arc::clone(&registry),
        Arc::new(broker.clone()),
        PushPolicy::default(),
    );
    publisher.start().await.unwrap();

    let cancel = CancellationToken::new();
    tokio::spawn(publisher.run(events, cancel.clone()));

    Stack {
        broker,
        registry,
        cancel,
    }
}

fn new_subscriber(broker: &InMemoryBroker, store: Arc<SqliteSessionStore>) -> TwinSubscriber {
    TwinSubscriber::new(
        Arc::new(broker.clone()),
        store,
        Some(Arc::new(JsonDiffEngine::new())),
        Uuid::new_v4(),
        TwinSubscriberConfig::default(),
    )
}

fn callbacks() -> (
    UpdateCallback,
    RemovedCallback,
    mpsc::UnboundedReceiver<(u64, Vec<u8>)>,
    mpsc::UnboundedReceiver<TwinKey>,
) {
    let (update_tx, update_rx) = mpsc::unbounded_channel();
    let (removed_tx, removed_rx) = mpsc::unbounded_channel();

    let on_update: UpdateCallback = Arc::new(move |_key, version, payload| {
        let _ = update_tx.send((version, payload.to_vec()));
    });
    let on_removed: RemovedCallback = Arc::new(move |key| {
        let _ = removed_tx.send(key.clone());
    });

    (on_update, on_removed, update_rx, removed_rx)
}

#[tokio::test]
async fn publish_resolve_push_never_regresses() {
    let stack = start_stack().await;
    let key = TwinKey::global("alpha");

    assert_eq!(stack.registry.publish(&key, br#"{"x":1}"#.to_vec()), 1);

    let store = Arc::new(SqliteSessionStore::in_memory().unwrap());
    let subscriber = new_subscriber(&stack.broker, store);
    let (on_update, on_removed, mut updates, _removed) = callbacks();
    let _handle = subscriber.subscribe(key.clone(), on_update, on_removed);

    let (version, payload) = timeout(WAIT, updates.recv()).await.unwrap().unwrap();
    assert_eq!(version, 1);
    assert_eq!(payload, br#"{"x":1}"#.to_vec());

    assert_eq!(stack.registry.publish(&key, br#"{"x":2}"#.to_vec()), 2);

    let (version, payload) = timeout(WAIT, updates.recv()).await.unwrap().unwrap();
    assert_eq!(version, 2);
    assert_eq!(payload, br#"{"x":2}"#.to_vec());

    // Version 1 is never delivered again.
    assert!(timeout(QUIET, updates.recv()).await.is_err());

    subscriber.shutdown();
}

#[tokio::test]
async fn lost_pushes_are_recovered_by_later_snapshot() {
    let stack = start_stack().await;
    let key = TwinKey::global("alpha");
    stack.registry.publish(&key, br#"{"x":1}"#.to_vec());

    let store = Arc::new(SqliteSessionStore::in_memory().unwrap());
    let subscriber = new_subscriber(&stack.broker, store);
    let (on_update, on_removed, mut updates, _removed) = callbacks();
    let handle = subscriber.subscribe(key.clone(), on_update, on_removed);

    let (version, _) = timeout(WAIT, updates.recv()).await.unwrap().unwrap();
    assert_eq!(version, 1);

    // Broker outage swallows the version-2 push.
    stack.broker.set_available(false);
    stack.registry.publish(&key, br#"{"x":2}"#.to_vec());
    tokio::time::sleep(Duration::from_millis(100)).await;
    stack.broker.set_available(true);

    // The next change is pushed as a full snapshot and applies cleanly.
    stack.registry.publish(&key, br#"{"x":3}"#.to_vec());

    let (version, payload) = timeout(WAIT, updates.recv()).await.unwrap().unwrap();
    assert_eq!(version, 3);
    assert_eq!(payload, br#"{"x":3}"#.to_vec());
    assert_eq!(handle.last_applied_version(), 3);

    subscriber.shutdown();
}

#[tokio::test]
async fn large_changes_replicate_as_patches() {
    fn payload(x: u64) -> Vec<u8> {
        let padding = "p".repeat(2048);
        format!(r#"{{"x":{x},"padding":"{padding}"}}"#).into_bytes()
    }

    let stack = start_stack().await;
    let key = TwinKey::global("alpha");
    stack.registry.publish(&key, payload(1));

    // Two mirrors; their pulls register the sessions the push policy needs
    // before a patch is worth broadcasting.
    let sub_a = new_subscriber(&stack.broker, Arc::new(SqliteSessionStore::in_memory().unwrap()));
    let sub_b = new_subscriber(&stack.broker, Arc::new(SqliteSessionStore::in_memory().unwrap()));
    let (on_update_a, on_removed_a, mut updates_a, _removed_a) = callbacks();
    let (on_update_b, on_removed_b, mut updates_b, _removed_b) = callbacks();
    let _handle_a = sub_a.subscribe(key.clone(), on_update_a, on_removed_a);
    let _handle_b = sub_b.subscribe(key.clone(), on_update_b, on_removed_b);

    let (version, _) = timeout(WAIT, updates_a.recv()).await.unwrap().unwrap();
    assert_eq!(version, 1);
    let (version, _) = timeout(WAIT, updates_b.recv()).await.unwrap().unwrap();
    assert_eq!(version, 1);
    assert_eq!(stack.registry.session_count(&key), 2);

    stack.registry.publish(&key, payload(2));

    for updates in [&mut updates_a, &mut updates_b] {
        let (version, received) = timeout(WAIT, updates.recv()).await.unwrap().unwrap();
        assert_eq!(version, 2);
        let received: serde_json::Value = serde_json::from_slice(&received).unwrap();
        let expected: serde_json::Value = serde_json::from_slice(&payload(2)).unwrap();
        assert_eq!(received, expected);
    }

    sub_a.shutdown();
    sub_b.shutdown();
}

#[tokio::test]
async fn deregister_notifies_current_and_future_subscribers() {
    let stack = start_stack().await;
    let key = TwinKey::global("alpha");
    stack.registry.publish(&key, br#"{"x":1}"#.to_vec());

    let sub_a = new_subscriber(&stack.broker, Arc::new(SqliteSessionStore::in_memory().unwrap()));
    let (on_update, on_removed, mut updates, mut removed_a) = callbacks();
    let handle_a = sub_a.subscribe(key.clone(), on_update, on_removed);

    timeout(WAIT, updates.recv()).await.unwrap().unwrap();

    assert!(stack.registry.deregister(&key));
    let removed_key = timeout(WAIT, removed_a.recv()).await.unwrap().unwrap();
    assert_eq!(removed_key, key);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(handle_a.current_value(), None);

    // A later subscription resolves straight to removal.
    let sub_b = new_subscriber(&stack.broker, Arc::new(SqliteSessionStore::in_memory().unwrap()));
    let (on_update, on_removed, mut updates_b, mut removed_b) = callbacks();
    let _handle_b = sub_b.subscribe(key.clone(), on_update, on_removed);

    let removed_key = timeout(WAIT, removed_b.recv()).await.unwrap().unwrap();
    assert_eq!(removed_key, key);
    assert!(timeout(QUIET, updates_b.recv()).await.is_err());

    // A fresh publish restarts the key at version 1.
    assert_eq!(stack.registry.publish(&key, br#"{"x":9}"#.to_vec()), 1);

    let sub_c = new_subscriber(&stack.broker, Arc::new(SqliteSessionStore::in_memory().unwrap()));
    let (on_update, on_removed, mut updates_c, _removed_c) = callbacks();
    let _handle_c = sub_c.subscribe(key.clone(), on_update, on_removed);

    let (version, payload) = timeout(WAIT, updates_c.recv()).await.unwrap().unwrap();
    assert_eq!(version, 1);
    assert_eq!(payload, br#"{"x":9}"#.to_vec());

    sub_a.shutdown();
    sub_b.shutdown();
    sub_c.shutdown();
}

#[tokio::test]
async fn restart_resumes_from_persisted_state() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("sessions.db");

    let stack = start_stack().await;
    let key = TwinKey::global("alpha");
    stack.registry.publish(&key, br#"{"x":5}"#.to_vec());

    {
        let store = Arc::new(SqliteSessionStore::open(&db_path).unwrap());
        let subscriber = new_subscriber(&stack.broker, store);
        let (on_update, on_removed, mut updates, _removed) = callbacks();
        let _handle = subscriber.subscribe(key.clone(), on_update, on_removed);

        let (version, _) = timeout(WAIT, updates.recv()).await.unwrap().unwrap();
        assert_eq!(version, 1);

        // Teardown without unsubscribing keeps the persisted state.
        subscriber.shutdown();
    }

    // The broker is down when the "restarted" process comes back.
    stack.broker.set_available(false);

    let store = Arc::new(SqliteSessionStore::open(&db_path).unwrap());
    let subscriber = new_subscriber(&stack.broker, store);
    let (on_update, on_removed, mut updates, _removed) = callbacks();
    let handle = subscriber.subscribe(key, on_update, on_removed);

    assert_eq!(handle.current_value(), Some(br#"{"x":5}"#.to_vec()));
    let (version, payload) = timeout(WAIT, updates.recv()).await.unwrap().unwrap();
    assert_eq!(version, 1);
    assert_eq!(payload, br#"{"x":5}"#.to_vec());

    subscriber.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mqtt_update_roundtrip() {
    use twinsync_proto::{TopicScheme, TwinUpdate};
    use twinsync_transport::{MqttTransport, MqttTransportConfig};

    if std::env::var("TWINSYNC_INTEGRATION").is_err() {
        eprintln!("Skipping integration test; set TWINSYNC_INTEGRATION=1 to run");
        return;
    }

    let broker_url = std::env::var("TWINSYNC_MQTT_BROKER")
        .unwrap_or_else(|_| "tcp://localhost:1883".to_string());
    let scheme = TopicScheme::new("twinsync-it");
    let key = TwinKey::scoped("alpha", "zone-1");

    let receiver = MqttTransport::connect(MqttTransportConfig {
        broker_url: broker_url.clone(),
        client_id: format!("twinsync-it-sub-{}", Uuid::new_v4()),
        session_id: Uuid::new_v4(),
        scheme: scheme.clone(),
        keep_alive: Duration::from_secs(5),
    })
    .await
    .unwrap();
    let mut updates = receiver.subscribe_updates(&key).await.unwrap();

    let sender = MqttTransport::connect(MqttTransportConfig {
        broker_url,
        client_id: format!("twinsync-it-pub-{}", Uuid::new_v4()),
        session_id: Uuid::new_v4(),
        scheme,
        keep_alive: Duration::from_secs(5),
    })
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;

    let update = TwinUpdate::Object(TwinObject::snapshot(key.clone(), 1, br#"{"x":1}"#.to_vec()));
    sender.publish_update(&update).await.unwrap();

    let received = timeout(WAIT, updates.recv())
        .await
        .expect("timeout waiting for MQTT update")
        .expect("update channel closed");
    assert_eq!(received, update);
}
