//! Broker topic scheme for twin replication.
//!
//! Topic structure: `twinsync/v1/{namespace}/{location}/{message_type}`
//!
//! A globally scoped key uses `-` for the location level. Namespaces and
//! locations must not contain `/`. This allows:
//! - Per-key update topics a subscriber can subscribe to exactly
//! - One request wildcard the publisher serves for all keys
//! - Per-session response topics for pull correlation

use serde::{Deserialize, Serialize};
use twinsync_core::TwinKey;
use uuid::Uuid;

/// Protocol version for the topic scheme.
pub const PROTOCOL_VERSION: &str = "v1";

/// Topic level standing in for an absent location.
const GLOBAL_LOCATION: &str = "-";

/// Topic scheme configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicScheme {
    /// Topic prefix (default: "twinsync")
    pub prefix: String,
}

impl Default for TopicScheme {
    fn default() -> Self {
        Self {
            prefix: "twinsync".to_string(),
        }
    }
}

impl TopicScheme {
    /// Create a topic scheme with a custom prefix.
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Build the base topic path for a key.
    fn base(&self, key: &TwinKey) -> String {
        format!(
            "{}/{}/{}/{}",
            self.prefix,
            PROTOCOL_VERSION,
            key.namespace,
            key.location.as_deref().unwrap_or(GLOBAL_LOCATION)
        )
    }

    /// Topic pull requests for a key are published on.
    #[must_use]
    pub fn request(&self, key: &TwinKey) -> String {
        format!("{}/request", self.base(key))
    }

    /// Topic the response to a session's pull request is published on.
    #[must_use]
    pub fn response(&self, key: &TwinKey, session_id: Uuid) -> String {
        format!("{}/response/{session_id}", self.base(key))
    }

    /// Topic push updates for a key are broadcast on.
    #[must_use]
    pub fn update(&self, key: &TwinKey) -> String {
        format!("{}/update", self.base(key))
    }

    /// Wildcard matching pull requests for every key.
    #[must_use]
    pub fn request_wildcard(&self) -> String {
        format!("{}/{}/+/+/request", self.prefix, PROTOCOL_VERSION)
    }

    /// Wildcard matching responses addressed to one session, any key.
    #[must_use]
    pub fn response_wildcard(&self, session_id: Uuid) -> String {
        format!("{}/{}/+/+/response/{session_id}", self.prefix, PROTOCOL_VERSION)
    }

    /// Parse a topic into its key and message type.
    #[must_use]
    pub fn parse(&self, topic: &str) -> Option<(TwinKey, MessageType)> {
        let mut parts = topic.split('/');

        if parts.next() != Some(self.prefix.as_str()) || parts.next() != Some(PROTOCOL_VERSION) {
            return None;
        }

        let namespace = parts.next()?;
        let location = match parts.next()? {
            GLOBAL_LOCATION => None,
            location => Some(location.to_string()),
        };
        let key = TwinKey::new(namespace, location);

        let msg_type = match (parts.next()?, parts.next()) {
            ("request", None) => MessageType::Request,
            ("update", None) => MessageType::Update,
            ("response", Some(session)) => {
                let session_id = Uuid::parse_str(session).ok()?;
                MessageType::Response(session_id)
            }
            _ => return None,
        };

        if parts.next().is_some() {
            return None;
        }

        Some((key, msg_type))
    }
}

/// Message types in the protocol, as addressed by topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Pull request
    Request,
    /// Pull response addressed to one session
    Response(Uuid),
    /// Broadcast push update
    Update,
}
