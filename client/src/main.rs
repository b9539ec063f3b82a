use agentsync::StatePatch;
use agentsync_client::{ClientConfig, ClientEvent, ConnectionManager};
use anyhow::{Context, Result};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

const ACTION_PERIOD: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agentsync_client=info".into()),
        )
        .init();

    let config = ClientConfig::from_env();
    let url = config.resolve_url();
    let manager = ConnectionManager::new(config);

    let mut events = manager.subscribe();
    let logger = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ClientEvent::StateChanged { agent_id, state }) => {
                    info!(agent_id = %agent_id, position = ?state.position, action = %state.action, reward = state.reward, done = state.done, "State changed");
                }
                Ok(ClientEvent::AgentRemoved { agent_id }) => info!(agent_id = %agent_id, "Agent left"),
                Ok(ClientEvent::ServerError(error)) => warn!(error = %error, "Server error"),
                Ok(ClientEvent::ReconnectExhausted { attempts }) => {
                    warn!(attempts, "Reconnection exhausted");
                }
                Ok(event) => info!(event = ?event, "Event"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event logger lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    manager
        .connect(url.clone())
        .await
        .with_context(|| format!("connecting to {}", url))?;

    // Simple actor: announce the agent, then act on a fixed period
    let actor = std::env::var("AGENTSYNC_AGENT_ID").ok().map(|agent_id| {
        let manager = manager.clone();
        tokio::spawn(async move {
            let announce = StatePatch {
                action: Some("idle".to_string()),
                ..StatePatch::default()
            };
            if let Err(e) = manager.send_state(&agent_id, &announce) {
                warn!(error = %e, "Failed to announce agent");
            }

            let mut ticker = tokio::time::interval(ACTION_PERIOD);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut step: u64 = 0;
            loop {
                ticker.tick().await;
                step += 1;
                let mut data = Map::new();
                data.insert("action".to_string(), Value::String("step".to_string()));
                data.insert("step".to_string(), json!(step));
                if let Err(e) = manager.send_action(&agent_id, data) {
                    // Reconnection may bring the socket back
                    warn!(error = %e, "Action not sent");
                }
            }
        })
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    if let Some(actor) = actor {
        actor.abort();
    }
    manager.disconnect().await;
    logger.abort();
    Ok(())
}
