use super::SyncConfig;
use std::path::PathBuf;
use std::str::FromStr;

/// Apply `AGENTSYNC_*` environment overrides on top of a loaded config.
pub fn apply_overrides(config: &mut SyncConfig) {
    apply_overrides_from(config, |key| std::env::var(key).ok());
}

/// Same as [`apply_overrides`], reading variables through `lookup`.
///
/// Values that fail to parse are ignored and the existing value stays.
pub fn apply_overrides_from<F>(config: &mut SyncConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(host) = lookup("AGENTSYNC_HOST") {
        config.server.host = host;
    }
    if let Some(port) = parsed(&lookup, "AGENTSYNC_PORT") {
        config.server.port = port;
    }
    if let Some(secure) = parsed(&lookup, "AGENTSYNC_SECURE") {
        config.server.secure = secure;
    }
    if let Some(ms) = parsed(&lookup, "AGENTSYNC_IDLE_TIMEOUT_MS") {
        config.server.idle_timeout_ms = ms;
    }
    if let Some(ms) = parsed(&lookup, "AGENTSYNC_HEARTBEAT_INTERVAL_MS") {
        config.server.heartbeat_interval_ms = ms;
    }
    if let Some(cert) = lookup("AGENTSYNC_TLS_CERT") {
        config.tls.cert_path = Some(PathBuf::from(cert));
    }
    if let Some(key) = lookup("AGENTSYNC_TLS_KEY") {
        config.tls.key_path = Some(PathBuf::from(key));
    }
}

fn parsed<F, T>(lookup: &F, key: &str) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    lookup(key).and_then(|v| v.trim().parse::<T>().ok())
}
