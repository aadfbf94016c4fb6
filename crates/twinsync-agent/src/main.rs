//! # TwinSync Mirror Agent
//!
//! Daemon that subscribes to a configured set of twin keys over MQTT and
//! keeps the local session cache warm. A restart resumes from the persisted
//! cache immediately, before the broker is reachable again.

use anyhow::Result;
use tracing_subscriber::EnvFilter;

mod config;
mod runtime;

pub use config::AgentConfig;
pub use runtime::Mirror;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting TwinSync mirror agent"
    );

    let config = AgentConfig::from_env()?;
    let mirror = Mirror::new(config);

    mirror.run().await?;

    Ok(())
}
