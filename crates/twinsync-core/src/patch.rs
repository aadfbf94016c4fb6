//! Pluggable diff/patch collaborator.
//!
//! The publisher uses `diff` to turn consecutive full snapshots into compact
//! deltas; the subscriber uses `apply` to rebuild the next snapshot from its
//! cached payload. Engines may decline payload pairs they cannot express
//! (`Unsupported`); a failed application is `Corrupt` and triggers a resync,
//! never a subscription failure.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Computes and applies deltas between opaque payloads.
pub trait PatchEngine: Send + Sync {
    /// Compute a patch that transforms `old` into `new`.
    ///
    /// # Errors
    ///
    /// Returns `Unsupported` if the engine cannot express this payload pair
    /// as a delta.
    fn diff(&self, old: &[u8], new: &[u8]) -> Result<Vec<u8>, PatchError>;

    /// Apply a patch produced by `diff` to `old`, yielding the new payload.
    ///
    /// # Errors
    ///
    /// Returns `Corrupt` if the patch does not decode or does not fit `old`.
    fn apply(&self, old: &[u8], patch: &[u8]) -> Result<Vec<u8>, PatchError>;
}

/// Errors for diff/patch operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PatchError {
    /// The engine cannot express this payload pair as a delta
    #[error("payload pair not supported by this patch engine")]
    Unsupported,
    /// Patch application failed
    #[error("corrupt patch: {0}")]
    Corrupt(String),
}

/// A patch over a JSON object: dotted-path assignments plus removed paths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct JsonPatch {
    /// Paths assigned a new value
    set: BTreeMap<String, Value>,
    /// Paths removed from the object
    remove: Vec<String>,
}

/// Structural diff engine for JSON object payloads.
///
/// Nested objects are diffed recursively and addressed by dotted paths;
/// scalars and arrays are replaced wholesale. Payloads that are not JSON
/// objects are declined with `Unsupported`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonDiffEngine;

impl JsonDiffEngine {
    /// Create a new engine.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl PatchEngine for JsonDiffEngine {
    fn diff(&self, old: &[u8], new: &[u8]) -> Result<Vec<u8>, PatchError> {
        let old: Value = serde_json::from_slice(old).map_err(|_| PatchError::Unsupported)?;
        let new: Value = serde_json::from_slice(new).map_err(|_| PatchError::Unsupported)?;

        if !old.is_object() || !new.is_object() {
            return Err(PatchError::Unsupported);
        }

        let mut patch = JsonPatch {
            set: BTreeMap::new(),
            remove: Vec::new(),
        };
        diff_values(&old, &new, "", &mut patch);
        patch.remove.sort();

        serde_json::to_vec(&patch).map_err(|_| PatchError::Unsupported)
    }

    fn apply(&self, old: &[u8], patch: &[u8]) -> Result<Vec<u8>, PatchError> {
        let mut doc: Value = serde_json::from_slice(old)
            .map_err(|e| PatchError::Corrupt(format!("base payload is not JSON: {e}")))?;
        if !doc.is_object() {
            return Err(PatchError::Corrupt("base payload is not a JSON object".into()));
        }

        let patch: JsonPatch = serde_json::from_slice(patch)
            .map_err(|e| PatchError::Corrupt(format!("patch does not decode: {e}")))?;

        for path in &patch.remove {
            remove_path(&mut doc, path);
        }
        for (path, value) in &patch.set {
            set_path(&mut doc, path, value.clone())?;
        }

        serde_json::to_vec(&doc).map_err(|e| PatchError::Corrupt(e.to_string()))
    }
}

/// Recursively diff two JSON values, recording changes under dotted paths.
fn diff_values(old: &Value, new: &Value, path: &str, patch: &mut JsonPatch) {
    match (old, new) {
        (Value::Object(old_obj), Value::Object(new_obj)) => {
            for key in old_obj.keys() {
                if !new_obj.contains_key(key) {
                    patch.remove.push(child_path(path, key));
                }
            }
            for (key, new_val) in new_obj {
                let child = child_path(path, key);
                if let Some(old_val) = old_obj.get(key) {
                    diff_values(old_val, new_val, &child, patch);
                } else {
                    patch.set.insert(child, new_val.clone());
                }
            }
        }
        _ => {
            if old != new {
                patch.set.insert(path.to_string(), new.clone());
            }
        }
    }
}

fn child_path(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}

/// Set `value` at a dotted path, creating intermediate objects as needed.
fn set_path(doc: &mut Value, path: &str, value: Value) -> Result<(), PatchError> {
    let mut current = doc;
    let mut segments = path.split('.').peekable();

    while let Some(segment) = segments.next() {
        let map = current
            .as_object_mut()
            .ok_or_else(|| PatchError::Corrupt(format!("path '{path}' crosses a non-object")))?;

        if segments.peek().is_none() {
            map.insert(segment.to_string(), value);
            return Ok(());
        }

        current = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
    }

    Err(PatchError::Corrupt("empty patch path".into()))
}

/// Remove a dotted path. Missing paths are ignored.
fn remove_path(doc: &mut Value, path: &str) {
    let mut current = doc;
    let mut segments = path.split('.').peekable();

    while let Some(segment) = segments.next() {
        let Some(map) = current.as_object_mut() else {
            return;
        };

        if segments.peek().is_none() {
            map.remove(segment);
            return;
        }

        match map.get_mut(segment) {
            Some(next) => current = next,
            None => return,
        }
    }
}
