use std::str::FromStr;
use std::time::Duration;

/// Client connection settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Explicit server URL; derived from host, port and `secure` when unset
    pub url: Option<String>,
    pub host: String,
    pub server_port: u16,
    pub secure: bool,
    pub connect_timeout_ms: u64,
    pub max_reconnect_attempts: u32,
    pub reconnect_interval_ms: u64,
    /// Frames queued for the socket before `send` reports the queue full
    pub outbound_buffer: usize,
    /// Buffered events per subscriber before it starts lagging
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: "localhost".to_string(),
            server_port: 8765,
            secure: false,
            connect_timeout_ms: 30_000,
            max_reconnect_attempts: 3,
            reconnect_interval_ms: 5_000,
            outbound_buffer: 256,
            event_capacity: 1024,
        }
    }
}

impl ClientConfig {
    /// URL to connect to: `url` if set, else `ws(s)://host:port`.
    pub fn resolve_url(&self) -> String {
        if let Some(url) = &self.url {
            return url.clone();
        }
        let scheme = if self.secure { "wss" } else { "ws" };
        format!("{}://{}:{}", scheme, self.host, self.server_port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    /// Build from `AGENTSYNC_*` env vars, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(url) = lookup("AGENTSYNC_URL") {
            cfg.url = Some(url);
        }
        if let Some(n) = parsed(&lookup, "AGENTSYNC_MAX_RECONNECTS") {
            cfg.max_reconnect_attempts = n;
        }
        if let Some(ms) = parsed(&lookup, "AGENTSYNC_RECONNECT_INTERVAL_MS") {
            cfg.reconnect_interval_ms = ms;
        }
        if let Some(ms) = parsed(&lookup, "AGENTSYNC_CONNECT_TIMEOUT_MS") {
            cfg.connect_timeout_ms = ms;
        }

        cfg
    }
}

fn parsed<F, T>(lookup: &F, key: &str) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    lookup(key).and_then(|v| v.trim().parse().ok())
}
