//! Protocol messages for twin replication.

use serde::{Deserialize, Serialize};
use twinsync_core::{TwinKey, TwinObject};
use uuid::Uuid;

/// Pull request for a key's current snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TwinRequest {
    /// The key being resolved
    pub key: TwinKey,
    /// Identifier of the requesting subscriber session
    pub session_id: Uuid,
    /// The highest version the requester has applied; 0 if never seen
    pub last_known_version: u64,
}

impl TwinRequest {
    /// Create a new pull request.
    #[must_use]
    pub fn new(key: TwinKey, session_id: Uuid, last_known_version: u64) -> Self {
        Self {
            key,
            session_id,
            last_known_version,
        }
    }

    /// Serialize to CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_cbor(&self) -> Result<Vec<u8>, MessageError> {
        to_cbor(self)
    }

    /// Deserialize from CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns error if deserialization fails.
    pub fn from_cbor(bytes: &[u8]) -> Result<Self, MessageError> {
        from_cbor(bytes)
    }
}

/// Response to a pull request.
///
/// Pull responses are always full snapshots, never patches, so a late
/// joiner gets a consistent baseline in one round trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TwinResponse {
    /// The current full snapshot for the requested key
    Snapshot(TwinObject),
    /// The key has been deregistered
    Removed {
        /// The key that no longer exists
        key: TwinKey,
    },
}

impl TwinResponse {
    /// The key this response concerns.
    #[must_use]
    pub fn key(&self) -> &TwinKey {
        match self {
            TwinResponse::Snapshot(object) => &object.key,
            TwinResponse::Removed { key } => key,
        }
    }

    /// Serialize to CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_cbor(&self) -> Result<Vec<u8>, MessageError> {
        to_cbor(self)
    }

    /// Deserialize from CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns error if deserialization fails.
    pub fn from_cbor(bytes: &[u8]) -> Result<Self, MessageError> {
        from_cbor(bytes)
    }
}

/// Push message broadcast on a key's update topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TwinUpdate {
    /// A new version: full snapshot or patch
    Object(TwinObject),
    /// The key has been deregistered
    Removed {
        /// The key that no longer exists
        key: TwinKey,
    },
}

impl TwinUpdate {
    /// The key this update concerns.
    #[must_use]
    pub fn key(&self) -> &TwinKey {
        match self {
            TwinUpdate::Object(object) => &object.key,
            TwinUpdate::Removed { key } => key,
        }
    }

    /// Serialize to CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_cbor(&self) -> Result<Vec<u8>, MessageError> {
        to_cbor(self)
    }

    /// Deserialize from CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns error if deserialization fails.
    pub fn from_cbor(bytes: &[u8]) -> Result<Self, MessageError> {
        from_cbor(bytes)
    }
}

fn to_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, MessageError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(value, &mut bytes).map_err(|e| MessageError::Serialize(e.to_string()))?;
    Ok(bytes)
}

fn from_cbor<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, MessageError> {
    ciborium::from_reader(bytes).map_err(|e| MessageError::Deserialize(e.to_string()))
}

/// Errors for message serialization/deserialization.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MessageError {
    /// Serialization failed
    #[error("serialization failed: {0}")]
    Serialize(String),
    /// Deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialize(String),
}
