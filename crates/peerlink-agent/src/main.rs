//! Peerlink Agent Binary
//!
//! Serves the `Locator` service on the configured TCP address.

use anyhow::{Context, Result};
use peerlink_agent::{Agent, AgentConfig};
use tracing::{error, info};

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = AgentConfig::from_env().context("Invalid agent configuration")?;

    // Protocol logic runs on this one thread
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build runtime")?;

    runtime.block_on(async move {
        info!("Starting peerlink agent '{}'", config.name);
        let mut agent = Agent::new(config);

        if let Some(shutdown) = agent.shutdown_sender() {
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    let _ = shutdown.send(());
                }
            });
        }

        if let Err(e) = agent.run().await {
            error!("Agent error: {}", e);
            return Err(anyhow::Error::from(e));
        }

        info!("Agent shutting down");
        Ok(())
    })
}
