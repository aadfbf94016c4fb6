//! Subscriber-local session state.

use crate::key::TwinKey;
use serde::{Deserialize, Serialize};

/// A subscriber's durable record of the last version it has applied for a
/// key, together with the payload at that version.
///
/// Version 0 with an empty payload means the key has never been seen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    /// The key this state tracks
    pub key: TwinKey,
    /// Last version successfully applied; 0 if never seen
    pub last_applied_version: u64,
    /// Payload at `last_applied_version`
    pub cached_payload: Vec<u8>,
}

impl SessionState {
    /// State for a key that has never been seen.
    #[must_use]
    pub fn empty(key: TwinKey) -> Self {
        Self {
            key,
            last_applied_version: 0,
            cached_payload: Vec::new(),
        }
    }

    /// Whether a cached payload is available.
    #[must_use]
    pub fn has_cache(&self) -> bool {
        self.last_applied_version > 0
    }
}
