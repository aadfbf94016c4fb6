//! Agent configuration.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use twinsync_core::TwinKey;
use uuid::Uuid;

/// Mirror agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Session identifier; generated when absent
    pub session_id: Option<Uuid>,

    /// MQTT broker URL for twin replication
    pub mqtt_broker: String,

    /// Topic prefix shared with the publisher
    pub topic_prefix: String,

    /// Session database path
    pub db_path: PathBuf,

    /// Timeout for a single pull attempt
    pub pull_timeout: Duration,

    /// Keys to mirror
    pub keys: Vec<KeyConfig>,
}

/// One mirrored key.
#[derive(Debug, Clone, Deserialize)]
pub struct KeyConfig {
    /// Namespace of the twin object
    pub namespace: String,

    /// Optional deployment zone; absent means global
    #[serde(default)]
    pub location: Option<String>,
}

impl KeyConfig {
    /// The twin key this entry mirrors.
    #[must_use]
    pub fn key(&self) -> TwinKey {
        TwinKey::new(self.namespace.clone(), self.location.clone())
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            session_id: None,
            mqtt_broker: "tcp://localhost:1883".to_string(),
            topic_prefix: "twinsync".to_string(),
            db_path: PathBuf::from("./twinsync.db"),
            pull_timeout: Duration::from_secs(10),
            keys: Vec::new(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `TWINSYNC_SESSION_ID`: Session UUID
    /// - `TWINSYNC_MQTT_BROKER`: MQTT broker URL
    /// - `TWINSYNC_TOPIC_PREFIX`: Topic prefix
    /// - `TWINSYNC_DB_PATH`: Session database path
    /// - `TWINSYNC_PULL_TIMEOUT_SECS`: Pull attempt timeout in seconds
    /// - `TWINSYNC_KEYS`: JSON array of `{"namespace": ..., "location": ...}`
    ///
    /// # Errors
    ///
    /// Returns error if a variable does not parse.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(id) = std::env::var("TWINSYNC_SESSION_ID") {
            config.session_id = Some(Uuid::parse_str(&id).context("Invalid TWINSYNC_SESSION_ID")?);
        }

        if let Ok(broker) = std::env::var("TWINSYNC_MQTT_BROKER") {
            config.mqtt_broker = broker;
        }

        if let Ok(prefix) = std::env::var("TWINSYNC_TOPIC_PREFIX") {
            config.topic_prefix = prefix;
        }

        if let Ok(db_path) = std::env::var("TWINSYNC_DB_PATH") {
            config.db_path = PathBuf::from(db_path);
        }

        if let Ok(secs) = std::env::var("TWINSYNC_PULL_TIMEOUT_SECS") {
            let secs: u64 = secs.parse().context("Invalid TWINSYNC_PULL_TIMEOUT_SECS")?;
            config.pull_timeout = Duration::from_secs(secs);
        }

        if let Ok(keys_json) = std::env::var("TWINSYNC_KEYS") {
            config.keys =
                serde_json::from_str(&keys_json).context("Invalid TWINSYNC_KEYS JSON")?;
        }

        Ok(config)
    }
}
