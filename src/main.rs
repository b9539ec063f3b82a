use agentsync::{config, SyncServer};
use anyhow::{bail, Result};
use tracing::{debug, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agentsync=info".into()),
        )
        .init();

    info!("agentsync starting...");

    let config = config::load()?;
    info!(
        addr = %config.server.bind_addr(),
        secure = config.server.secure,
        idle_timeout_ms = config.server.idle_timeout_ms,
        heartbeat_interval_ms = config.server.heartbeat_interval_ms,
        "Configuration loaded"
    );

    let server = SyncServer::new(config);
    if !server.start().await {
        bail!("server failed to start");
    }

    // Log client actions; an embedding driver would compute the next state here
    let mut actions = server.subscribe_actions();
    let action_logger = tokio::spawn(async move {
        loop {
            match actions.recv().await {
                Ok(action) => {
                    debug!(agent_id = %action.agent_id, connection_id = %action.connection_id, data = ?action.data, "Action received")
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Action logger lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    server.stop().await;
    action_logger.abort();

    info!("agentsync stopped");
    Ok(())
}
