//! Authoritative store of published twin objects.
//!
//! One registry instance per publisher process. The registry is the single
//! writer of each key's version and payload; mutation is serialized per key
//! behind a per-entry lock while different keys proceed independently.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;
use twinsync_core::{PatchEngine, TwinKey, TwinObject};
use uuid::Uuid;

/// Change notifications emitted by the registry, consumed by the publisher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// A new version of the key was published
    Changed(TwinKey),
    /// The key was deregistered
    Removed(TwinKey),
}

/// A patch retained for push: transforms `base_version` into
/// `base_version + 1`.
#[derive(Debug, Clone)]
pub struct PatchRecord {
    /// The version this patch applies against
    pub base_version: u64,
    /// Patch bytes produced by the diff collaborator
    pub payload: Vec<u8>,
}

struct RegistryEntry {
    current_version: u64,
    current_payload: Vec<u8>,
    /// Recent patches keyed by source version, oldest first
    patches: VecDeque<PatchRecord>,
    /// Sessions that have pulled this key
    sessions: HashSet<Uuid>,
}

impl RegistryEntry {
    fn new() -> Self {
        Self {
            current_version: 0,
            current_payload: Vec::new(),
            patches: VecDeque::new(),
            sessions: HashSet::new(),
        }
    }
}

/// Publisher-side store of named, versioned objects.
pub struct ObjectRegistry {
    entries: RwLock<HashMap<TwinKey, Arc<Mutex<RegistryEntry>>>>,
    engine: Option<Arc<dyn PatchEngine>>,
    patch_retention: usize,
    events: mpsc::UnboundedSender<RegistryEvent>,
}

impl ObjectRegistry {
    /// Patches retained per key by default.
    pub const DEFAULT_PATCH_RETENTION: usize = 8;

    /// Create a registry and the event stream the publisher consumes.
    ///
    /// Without a diff collaborator the registry records no patches and every
    /// push is a full snapshot.
    #[must_use]
    pub fn new(
        engine: Option<Arc<dyn PatchEngine>>,
    ) -> (Self, mpsc::UnboundedReceiver<RegistryEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        (
            Self {
                entries: RwLock::new(HashMap::new()),
                engine,
                patch_retention: Self::DEFAULT_PATCH_RETENTION,
                events,
            },
            receiver,
        )
    }

    /// Store `payload` as the new full snapshot for `key` and return the new
    /// version. The first publish of a key creates it at version 1.
    pub fn publish(&self, key: &TwinKey, payload: Vec<u8>) -> u64 {
        let entry = self.entry_or_create(key);
        let mut entry = entry.lock().expect("registry entry lock");

        if entry.current_version > 0 {
            if let Some(engine) = &self.engine {
                match engine.diff(&entry.current_payload, &payload) {
                    Ok(patch) => {
                        let base_version = entry.current_version;
                        entry.patches.push_back(PatchRecord {
                            base_version,
                            payload: patch,
                        });
                        while entry.patches.len() > self.patch_retention {
                            entry.patches.pop_front();
                        }
                    }
                    Err(err) => {
                        tracing::debug!(key = %key, error = %err, "No patch recorded for this publish");
                    }
                }
            }
        }

        entry.current_version += 1;
        entry.current_payload = payload;
        let version = entry.current_version;
        drop(entry);

        tracing::debug!(key = %key, version, "Published twin object");
        self.emit(RegistryEvent::Changed(key.clone()));
        version
    }

    /// Current full snapshot for `key`, never a patch.
    #[must_use]
    pub fn get(&self, key: &TwinKey) -> Option<TwinObject> {
        let entry = self.lookup(key)?;
        let entry = entry.lock().expect("registry entry lock");
        Some(TwinObject::snapshot(
            key.clone(),
            entry.current_version,
            entry.current_payload.clone(),
        ))
    }

    /// Remove `key`. Subsequent `get` returns `None`; subscribers are told
    /// the object no longer exists.
    ///
    /// Returns whether the key existed.
    pub fn deregister(&self, key: &TwinKey) -> bool {
        let removed = self
            .entries
            .write()
            .expect("registry map lock")
            .remove(key)
            .is_some();

        if removed {
            tracing::info!(key = %key, "Deregistered twin object");
            self.emit(RegistryEvent::Removed(key.clone()));
        }
        removed
    }

    /// Note that `session_id` pulled `key`, for the push policy.
    pub fn record_session(&self, key: &TwinKey, session_id: Uuid) {
        if let Some(entry) = self.lookup(key) {
            entry
                .lock()
                .expect("registry entry lock")
                .sessions
                .insert(session_id);
        }
    }

    /// Number of sessions that have pulled `key`.
    #[must_use]
    pub fn session_count(&self, key: &TwinKey) -> usize {
        self.lookup(key)
            .map_or(0, |entry| entry.lock().expect("registry entry lock").sessions.len())
    }

    /// The retained patch leading into the current version, if any.
    #[must_use]
    pub fn latest_patch(&self, key: &TwinKey) -> Option<PatchRecord> {
        let entry = self.lookup(key)?;
        let entry = entry.lock().expect("registry entry lock");
        entry
            .patches
            .back()
            .filter(|patch| patch.base_version + 1 == entry.current_version)
            .cloned()
    }

    fn entry_or_create(&self, key: &TwinKey) -> Arc<Mutex<RegistryEntry>> {
        if let Some(entry) = self.lookup(key) {
            return entry;
        }
        let mut entries = self.entries.write().expect("registry map lock");
        Arc::clone(
            entries
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(RegistryEntry::new()))),
        )
    }

    fn lookup(&self, key: &TwinKey) -> Option<Arc<Mutex<RegistryEntry>>> {
        self.entries
            .read()
            .expect("registry map lock")
            .get(key)
            .map(Arc::clone)
    }

    fn emit(&self, event: RegistryEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("Registry event receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use twinsync_core::JsonDiffEngine;

    fn registry_with_engine() -> (ObjectRegistry, mpsc::UnboundedReceiver<RegistryEvent>) {
        ObjectRegistry::new(Some(Arc::new(JsonDiffEngine::new())))
    }

    #[test]
    fn first_publish_creates_version_one() {
        let (registry, _events) = registry_with_engine();
        let key = TwinKey::global("alpha");

        assert_eq!(registry.publish(&key, br#"{"x":1}"#.to_vec()), 1);
        assert_eq!(registry.publish(&key, br#"{"x":2}"#.to_vec()), 2);

        let object = registry.get(&key).unwrap();
        assert_eq!(object.version, 2);
        assert!(!object.is_patch);
        assert_eq!(object.payload, br#"{"x":2}"#.to_vec());
    }

    #[test]
    fn publishes_to_different_keys_are_independent() {
        let (registry, _events) = registry_with_engine();

        assert_eq!(registry.publish(&TwinKey::global("alpha"), b"{}".to_vec()), 1);
        assert_eq!(registry.publish(&TwinKey::scoped("alpha", "zone-1"), b"{}".to_vec()), 1);
        assert_eq!(registry.publish(&TwinKey::global("beta"), b"{}".to_vec()), 1);
    }

    #[test]
    fn deregister_removes_and_notifies() {
        let (registry, mut events) = registry_with_engine();
        let key = TwinKey::global("alpha");

        registry.publish(&key, b"{}".to_vec());
        assert_eq!(events.try_recv().unwrap(), RegistryEvent::Changed(key.clone()));

        assert!(registry.deregister(&key));
        assert_eq!(events.try_recv().unwrap(), RegistryEvent::Removed(key.clone()));

        assert!(registry.get(&key).is_none());
        assert!(!registry.deregister(&key));

        // Re-publish recreates the key from version 1.
        assert_eq!(registry.publish(&key, b"{}".to_vec()), 1);
    }

    #[test]
    fn patch_history_tracks_consecutive_versions() {
        let (registry, _events) = registry_with_engine();
        let key = TwinKey::global("alpha");

        registry.publish(&key, br#"{"x":1}"#.to_vec());
        assert!(registry.latest_patch(&key).is_none());

        registry.publish(&key, br#"{"x":2}"#.to_vec());
        let patch = registry.latest_patch(&key).unwrap();
        assert_eq!(patch.base_version, 1);

        let engine = JsonDiffEngine::new();
        let rebuilt = engine.apply(br#"{"x":1}"#, &patch.payload).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&rebuilt).unwrap();
        assert_eq!(value, serde_json::json!({"x": 2}));
    }

    #[test]
    fn patch_history_is_bounded() {
        let (registry, _events) = registry_with_engine();
        let key = TwinKey::global("alpha");

        for i in 0..ObjectRegistry::DEFAULT_PATCH_RETENTION + 5 {
            let payload = format!(r#"{{"x":{i}}}"#).into_bytes();
            registry.publish(&key, payload);
        }

        let entry = registry.lookup(&key).unwrap();
        let entry = entry.lock().unwrap();
        assert_eq!(entry.patches.len(), ObjectRegistry::DEFAULT_PATCH_RETENTION);
    }

    #[test]
    fn sessions_are_tracked_per_key() {
        let (registry, _events) = registry_with_engine();
        let key = TwinKey::global("alpha");
        registry.publish(&key, b"{}".to_vec());

        let session = Uuid::new_v4();
        registry.record_session(&key, session);
        registry.record_session(&key, session);
        registry.record_session(&key, Uuid::new_v4());

        assert_eq!(registry.session_count(&key), 2);
        assert_eq!(registry.session_count(&TwinKey::global("beta")), 0);
    }
}
