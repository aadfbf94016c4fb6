//! Subscriber runtime: one resolution task per subscribed key.
//!
//! Each key moves through `RESOLVING` (initial pull, cache served
//! immediately), `SYNCED` (push updates applied through the reconciler),
//! and `STALE` (gap detected, one fresh pull) until unsubscribed. The push
//! channel is opened before the first pull so pushes racing the pull
//! response are buffered and replayed through the reconciler once the
//! baseline is known.

use crate::retry::RetryPolicy;
use crate::store::SqliteSessionStore;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use twinsync_core::{reconcile, PatchEngine, Reconciliation, SessionState, TwinKey, TwinObject};
use twinsync_proto::{TwinRequest, TwinResponse, TwinUpdate};
use twinsync_transport::BrokerTransport;
use uuid::Uuid;

/// Invoked with `(key, version, payload)` for every accepted version.
/// Versions are strictly increasing per key.
pub type UpdateCallback = Arc<dyn Fn(&TwinKey, u64, &[u8]) + Send + Sync>;

/// Invoked once when the key is deregistered at the publisher.
pub type RemovedCallback = Arc<dyn Fn(&TwinKey) + Send + Sync>;

/// Subscriber tuning.
#[derive(Debug, Clone)]
pub struct TwinSubscriberConfig {
    /// Timeout for a single pull attempt
    pub pull_timeout: Duration,
    /// Backoff between failed pull attempts
    pub retry: RetryPolicy,
}

impl Default for TwinSubscriberConfig {
    fn default() -> Self {
        Self {
            pull_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}

/// Maintains an always-available local view of each subscribed key.
pub struct TwinSubscriber {
    transport: Arc<dyn BrokerTransport>,
    store: Arc<SqliteSessionStore>,
    engine: Option<Arc<dyn PatchEngine>>,
    session_id: Uuid,
    config: TwinSubscriberConfig,
    shutdown: CancellationToken,
}

impl TwinSubscriber {
    /// Create a subscriber.
    ///
    /// `session_id` must match the transport's pull-response addressing
    /// (for MQTT, the session configured on the transport).
    #[must_use]
    pub fn new(
        transport: Arc<dyn BrokerTransport>,
        store: Arc<SqliteSessionStore>,
        engine: Option<Arc<dyn PatchEngine>>,
        session_id: Uuid,
        config: TwinSubscriberConfig,
    ) -> Self {
        Self {
            transport,
            store,
            engine,
            session_id,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// This subscriber's session identifier.
    #[must_use]
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Subscribe to a key.
    ///
    /// If persisted state exists, the cached payload is delivered to
    /// `on_update` immediately, before any network round trip; the pull then
    /// reconciles with the publisher in the background.
    pub fn subscribe(
        &self,
        key: TwinKey,
        on_update: UpdateCallback,
        on_removed: RemovedCallback,
    ) -> TwinHandle {
        let state = self.store.load(&key).unwrap_or_else(|err| {
            tracing::warn!(key = %key, error = %err, "Failed to load session state, starting empty");
            SessionState::empty(key.clone())
        });
        let cache = Arc::new(RwLock::new(state));
        let cancel = self.shutdown.child_token();

        let task = KeyTask {
            key: key.clone(),
            cache: Arc::clone(&cache),
            transport: Arc::clone(&self.transport),
            store: Arc::clone(&self.store),
            engine: self.engine.clone(),
            session_id: self.session_id,
            pull_timeout: self.config.pull_timeout,
            retry: self.config.retry.clone(),
            cancel: cancel.clone(),
            on_update,
            on_removed,
        };
        tokio::spawn(task.run());

        TwinHandle {
            key,
            cache,
            cancel,
            store: Arc::clone(&self.store),
            transport: Arc::clone(&self.transport),
        }
    }

    /// Cancel every per-key task without forgetting session state, so a
    /// restarted subscriber resumes from its persisted cache.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

/// Handle to one key subscription.
pub struct TwinHandle {
    key: TwinKey,
    cache: Arc<RwLock<SessionState>>,
    cancel: CancellationToken,
    store: Arc<SqliteSessionStore>,
    transport: Arc<dyn BrokerTransport>,
}

impl TwinHandle {
    /// The subscribed key.
    #[must_use]
    pub fn key(&self) -> &TwinKey {
        &self.key
    }

    /// Latest cached payload, served synchronously even while disconnected.
    /// `None` until a version has ever been applied.
    #[must_use]
    pub fn current_value(&self) -> Option<Vec<u8>> {
        let state = self.cache.read().expect("cache lock");
        state.has_cache().then(|| state.cached_payload.clone())
    }

    /// Version of the cached payload; 0 if none.
    #[must_use]
    pub fn last_applied_version(&self) -> u64 {
        self.cache.read().expect("cache lock").last_applied_version
    }

    /// End the subscription: cancel any in-flight pull, forget session
    /// state, and release the push subscription.
    pub async fn unsubscribe(self) {
        self.cancel.cancel();
        if let Err(err) = self.store.forget(&self.key) {
            tracing::warn!(key = %self.key, error = %err, "Failed to forget session state");
        }
        if let Err(err) = self.transport.unsubscribe_updates(&self.key).await {
            tracing::debug!(key = %self.key, error = %err, "Failed to release push subscription");
        }
        tracing::info!(key = %self.key, "Unsubscribed");
    }
}

enum Resolution {
    Synced,
    Removed,
    Cancelled,
}

struct KeyTask {
    key: TwinKey,
    cache: Arc<RwLock<SessionState>>,
    transport: Arc<dyn BrokerTransport>,
    store: Arc<SqliteSessionStore>,
    engine: Option<Arc<dyn PatchEngine>>,
    session_id: Uuid,
    pull_timeout: Duration,
    retry: RetryPolicy,
    cancel: CancellationToken,
    on_update: UpdateCallback,
    on_removed: RemovedCallback,
}

impl KeyTask {
    async fn run(self) {
        // Push channel before the pull: pushes that race the pull response
        // are buffered here and replayed through the reconciler.
        let Some(mut updates) = self.open_updates().await else {
            return;
        };

        {
            let state = self.cache.read().expect("cache lock");
            if state.has_cache() {
                (self.on_update)(&self.key, state.last_applied_version, &state.cached_payload);
            }
        }

        tracing::debug!(key = %self.key, session_id = %self.session_id, "Resolving");
        match self.resolve().await {
            Resolution::Synced => {}
            Resolution::Removed | Resolution::Cancelled => return,
        }

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return,
                update = updates.recv() => {
                    let Some(update) = update else {
                        tracing::warn!(key = %self.key, "Update channel closed, reopening and resyncing");
                        match self.open_updates().await {
                            Some(rx) => updates = rx,
                            None => return,
                        }
                        match self.resolve().await {
                            Resolution::Synced => continue,
                            Resolution::Removed | Resolution::Cancelled => return,
                        }
                    };

                    match update {
                        TwinUpdate::Removed { .. } => {
                            self.removed().await;
                            return;
                        }
                        TwinUpdate::Object(object) => {
                            if !self.apply_object(&object) {
                                tracing::info!(key = %self.key, "Gap detected, resyncing");
                                match self.resolve().await {
                                    Resolution::Synced => {}
                                    Resolution::Removed | Resolution::Cancelled => return,
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    /// Open the push channel, retrying with backoff until cancelled.
    async fn open_updates(&self) -> Option<mpsc::Receiver<TwinUpdate>> {
        let mut attempt = 0_u32;
        loop {
            let subscribe = self.transport.subscribe_updates(&self.key);
            let outcome = tokio::select! {
                () = self.cancel.cancelled() => return None,
                outcome = subscribe => outcome,
            };

            match outcome {
                Ok(rx) => return Some(rx),
                Err(err) => {
                    let delay = self.retry.delay(attempt);
                    tracing::warn!(
                        key = %self.key,
                        error = %err,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "Push subscription failed, retrying"
                    );
                    attempt = attempt.saturating_add(1);
                    tokio::select! {
                        () = self.cancel.cancelled() => return None,
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Pull the current snapshot, retrying with backoff until it arrives,
    /// the key turns out to be removed, or the task is cancelled. The cached
    /// value keeps being served throughout.
    async fn resolve(&self) -> Resolution {
        let mut attempt = 0_u32;
        loop {
            let last = self.cache.read().expect("cache lock").last_applied_version;
            let request = TwinRequest::new(self.key.clone(), self.session_id, last);
            let pull = self.transport.request(request, self.pull_timeout);

            let outcome = tokio::select! {
                () = self.cancel.cancelled() => return Resolution::Cancelled,
                outcome = pull => outcome,
            };

            match outcome {
                Ok(TwinResponse::Snapshot(object)) => {
                    // Pull responses are full snapshots: they either apply
                    // or are already covered by the cache.
                    self.apply_object(&object);
                    return Resolution::Synced;
                }
                Ok(TwinResponse::Removed { .. }) => {
                    self.removed().await;
                    return Resolution::Removed;
                }
                Err(err) => {
                    let delay = self.retry.delay(attempt);
                    tracing::warn!(
                        key = %self.key,
                        error = %err,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "Pull failed, retrying"
                    );
                    attempt = attempt.saturating_add(1);
                    tokio::select! {
                        () = self.cancel.cancelled() => return Resolution::Cancelled,
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Run one incoming object through the reconciler.
    ///
    /// Returns `false` when a resync is required.
    fn apply_object(&self, object: &TwinObject) -> bool {
        let verdict = {
            let state = self.cache.read().expect("cache lock");
            reconcile(
                state.last_applied_version,
                &state.cached_payload,
                object,
                self.engine.as_deref(),
            )
        };

        match verdict {
            Reconciliation::Apply { payload, version } => {
                self.commit(version, &payload);
                true
            }
            Reconciliation::Ignore => {
                tracing::debug!(key = %self.key, version = object.version, "Ignoring duplicate or stale message");
                true
            }
            Reconciliation::ResyncRequired => false,
        }
    }

    fn commit(&self, version: u64, payload: &[u8]) {
        if self.cancel.is_cancelled() {
            return;
        }

        if let Err(err) = self.store.record(&self.key, version, payload) {
            tracing::warn!(key = %self.key, version, error = %err, "Failed to persist session state");
        }

        {
            let mut state = self.cache.write().expect("cache lock");
            state.last_applied_version = version;
            state.cached_payload = payload.to_vec();
        }

        tracing::debug!(key = %self.key, version, "Applied twin update");
        (self.on_update)(&self.key, version, payload);
    }

    async fn removed(&self) {
        tracing::info!(key = %self.key, "Twin object removed by publisher");
        (self.on_removed)(&self.key);

        if let Err(err) = self.store.forget(&self.key) {
            tracing::warn!(key = %self.key, error = %err, "Failed to forget session state");
        }
        {
            let mut state = self.cache.write().expect("cache lock");
            *state = SessionState::empty(self.key.clone());
        }
        if let Err(err) = self.transport.unsubscribe_updates(&self.key).await {
            tracing::debug!(key = %self.key, error = %err, "Failed to release push subscription");
        }
    }
}
