//! Versioned units of replication.

use crate::key::TwinKey;
use serde::{Deserialize, Serialize};

/// A versioned unit of replication.
///
/// The payload is either a full snapshot, independently applicable, or a
/// patch valid only against the prior version named in `base_version`.
/// Versions are monotonically increasing per key; the first publish of a key
/// is version 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TwinObject {
    /// The key this object replicates
    pub key: TwinKey,
    /// Version of this payload, monotonic per key
    pub version: u64,
    /// Opaque payload bytes
    pub payload: Vec<u8>,
    /// Whether `payload` is a delta against `base_version`
    pub is_patch: bool,
    /// The version the patch applies against; set exactly when `is_patch`
    pub base_version: Option<u64>,
}

impl TwinObject {
    /// Create a full snapshot object.
    #[must_use]
    pub fn snapshot(key: TwinKey, version: u64, payload: Vec<u8>) -> Self {
        Self {
            key,
            version,
            payload,
            is_patch: false,
            base_version: None,
        }
    }

    /// Create a patch object against `base_version`.
    #[must_use]
    pub fn patch(key: TwinKey, base_version: u64, version: u64, payload: Vec<u8>) -> Self {
        Self {
            key,
            version,
            payload,
            is_patch: true,
            base_version: Some(base_version),
        }
    }
}
