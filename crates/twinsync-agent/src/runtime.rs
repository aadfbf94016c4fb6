//! Mirror runtime orchestration.

use crate::config::AgentConfig;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use twinsync_core::JsonDiffEngine;
use twinsync_proto::TopicScheme;
use twinsync_subscriber::{
    RemovedCallback, SqliteSessionStore, TwinSubscriber, TwinSubscriberConfig, UpdateCallback,
};
use twinsync_transport::{MqttTransport, MqttTransportConfig};
use uuid::Uuid;

/// The mirror agent runtime.
pub struct Mirror {
    config: AgentConfig,
}

impl Mirror {
    /// Create a new mirror.
    #[must_use]
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }

    /// Run until Ctrl-C.
    ///
    /// Shutdown preserves session state so the next start serves the cache
    /// before the broker is reachable.
    ///
    /// # Errors
    ///
    /// Returns error if the transport or session store cannot be set up.
    pub async fn run(self) -> Result<()> {
        let session_id = self.config.session_id.unwrap_or_else(Uuid::new_v4);
        tracing::info!(%session_id, keys = self.config.keys.len(), "Mirror starting");

        let transport = MqttTransport::connect(MqttTransportConfig {
            broker_url: self.config.mqtt_broker.clone(),
            client_id: format!("twinsync-mirror-{session_id}"),
            session_id,
            scheme: TopicScheme::new(self.config.topic_prefix.clone()),
            keep_alive: Duration::from_secs(30),
        })
        .await
        .context("Failed to connect MQTT transport")?;

        let store = SqliteSessionStore::open(&self.config.db_path)
            .context("Failed to open session database")?;

        let subscriber = TwinSubscriber::new(
            Arc::new(transport),
            Arc::new(store),
            Some(Arc::new(JsonDiffEngine::new())),
            session_id,
            TwinSubscriberConfig {
                pull_timeout: self.config.pull_timeout,
                ..TwinSubscriberConfig::default()
            },
        );

        let on_update: UpdateCallback = Arc::new(|key, version, payload| {
            tracing::info!(key = %key, version, payload_len = payload.len(), "Twin updated");
        });
        let on_removed: RemovedCallback = Arc::new(|key| {
            tracing::warn!(key = %key, "Twin removed by publisher");
        });

        let mut handles = Vec::with_capacity(self.config.keys.len());
        for entry in &self.config.keys {
            let key = entry.key();
            tracing::info!(key = %key, "Mirroring twin");
            handles.push(subscriber.subscribe(
                key,
                Arc::clone(&on_update),
                Arc::clone(&on_removed),
            ));
        }

        tracing::info!("Mirror running, press Ctrl+C to stop");
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for shutdown signal")?;

        tracing::info!("Shutdown signal received");
        subscriber.shutdown();
        drop(handles);

        tracing::info!("Mirror stopped");
        Ok(())
    }
}
