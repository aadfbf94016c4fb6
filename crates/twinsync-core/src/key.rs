//! Composite identifiers for replicated twin objects.

use serde::{Deserialize, Serialize};

/// Identifier for a replicated twin object.
///
/// Combines a namespace (the logical object type or name) with an optional
/// location that scopes replication to one deployment zone. A key without a
/// location is globally scoped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TwinKey {
    /// Logical object type or name (e.g., "trapd.listener.config")
    pub namespace: String,
    /// Deployment zone the object is scoped to; `None` means global
    pub location: Option<String>,
}

impl TwinKey {
    /// Create a globally scoped key.
    #[must_use]
    pub fn global(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            location: None,
        }
    }

    /// Create a key scoped to a deployment zone.
    #[must_use]
    pub fn scoped(namespace: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            location: Some(location.into()),
        }
    }

    /// Build a key from a namespace and an optional location.
    #[must_use]
    pub fn new(namespace: impl Into<String>, location: Option<String>) -> Self {
        Self {
            namespace: namespace.into(),
            location,
        }
    }

    /// Whether this key is globally scoped.
    #[must_use]
    pub fn is_global(&self) -> bool {
        self.location.is_none()
    }
}

impl std::fmt::Display for TwinKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.location {
            Some(location) => write!(f, "{}@{}", self.namespace, location),
            None => write!(f, "{}", self.namespace),
        }
    }
}
