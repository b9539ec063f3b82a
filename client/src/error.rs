use thiserror::Error;
use tokio_tungstenite::tungstenite;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("not connected")]
    NotConnected,

    #[error("outbound queue full ({capacity} frames)")]
    QueueFull { capacity: usize },

    #[error("failed to connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: Box<tungstenite::Error>,
    },

    #[error("timed out connecting to {url} after {timeout_ms}ms")]
    ConnectTimeout { url: String, timeout_ms: u64 },

    #[error("connection attempt to {url} was superseded")]
    Aborted { url: String },

    #[error("failed to serialize envelope: {0}")]
    Serialize(#[from] serde_json::Error),
}
