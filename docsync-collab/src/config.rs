//! Client-side configuration.
//!
//! `CollabConfig::collaborative` is the only switch that decides between the
//! networked and the local provider. Everything else tunes the networked one.

use std::time::Duration;

/// Reconnect backoff: `min(base * 2^attempt, max)` with equal jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    pub base: Duration,
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
        }
    }
}

/// Room transport tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportConfig {
    pub backoff: BackoffConfig,
    /// Ping, awareness renewal and presence GC period.
    pub heartbeat_interval: Duration,
    /// Silence longer than `heartbeat_interval * liveness_multiplier` drops the socket.
    pub liveness_multiplier: u32,
    /// Remote presence expires after `heartbeat_interval * awareness_timeout_multiplier`.
    pub awareness_timeout_multiplier: u32,
    /// Consecutive undecodable frames tolerated before reconnecting.
    pub max_decode_errors: u32,
    pub max_frame_len: usize,
    pub connect_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            heartbeat_interval: Duration::from_secs(5),
            liveness_multiplier: 3,
            awareness_timeout_multiplier: 3,
            max_decode_errors: 8,
            max_frame_len: crate::codec::DEFAULT_MAX_FRAME_LEN,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl TransportConfig {
    /// Short timers for tests.
    pub fn for_testing() -> Self {
        Self {
            backoff: BackoffConfig {
                base: Duration::from_millis(20),
                max: Duration::from_millis(200),
            },
            heartbeat_interval: Duration::from_millis(100),
            liveness_multiplier: 10,
            awareness_timeout_multiplier: 3,
            max_decode_errors: 8,
            max_frame_len: crate::codec::DEFAULT_MAX_FRAME_LEN,
            connect_timeout: Duration::from_secs(2),
        }
    }

    pub fn liveness_timeout(&self) -> Duration {
        self.heartbeat_interval * self.liveness_multiplier
    }

    pub fn awareness_timeout(&self) -> Duration {
        self.heartbeat_interval * self.awareness_timeout_multiplier
    }
}

/// Process-wide collaboration settings.
#[derive(Debug, Clone, PartialEq)]
pub struct CollabConfig {
    /// Networked provider when true, local provider otherwise.
    pub collaborative: bool,
    /// WebSocket base URL of the relay, e.g. `ws://127.0.0.1:9090`.
    pub server_url: String,
    /// HTTP base URL of the relay lock API, e.g. `http://127.0.0.1:9091`.
    pub lock_api_url: String,
    /// Authorization token appended to the room URL.
    pub token: Option<String>,
    pub lock_request_timeout: Duration,
    /// Renewal period of a held initialization lock; keep it well under the
    /// relay's lease.
    pub lock_renew_interval: Duration,
    /// How long initialization waits for the first handshake before seeding.
    pub sync_timeout: Duration,
    pub transport: TransportConfig,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            collaborative: false,
            server_url: "ws://127.0.0.1:9090".to_string(),
            lock_api_url: "http://127.0.0.1:9091".to_string(),
            token: None,
            lock_request_timeout: Duration::from_secs(5),
            lock_renew_interval: crate::lock::DEFAULT_LOCK_RENEW_INTERVAL,
            sync_timeout: Duration::from_secs(10),
            transport: TransportConfig::default(),
        }
    }
}

impl CollabConfig {
    /// Networked config against a relay on localhost (for tests).
    pub fn for_testing(ws_port: u16, http_port: u16) -> Self {
        Self {
            collaborative: true,
            server_url: format!("ws://127.0.0.1:{ws_port}"),
            lock_api_url: format!("http://127.0.0.1:{http_port}"),
            token: None,
            lock_request_timeout: Duration::from_secs(2),
            lock_renew_interval: Duration::from_millis(50),
            sync_timeout: Duration::from_secs(3),
            transport: TransportConfig::for_testing(),
        }
    }

    /// Defaults overridden by `DOCSYNC_*` environment variables.
    ///
    /// - `DOCSYNC_COLLABORATIVE` (`1`/`true`/`yes`)
    /// - `DOCSYNC_SERVER_URL`, `DOCSYNC_LOCK_URL`, `DOCSYNC_TOKEN`
    /// - `DOCSYNC_HEARTBEAT_MS`, `DOCSYNC_LOCK_TIMEOUT_MS`, `DOCSYNC_LOCK_RENEW_MS`
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(v) = lookup("DOCSYNC_COLLABORATIVE") {
            config.collaborative = parse_flag(&v);
        }
        if let Some(v) = lookup("DOCSYNC_SERVER_URL") {
            config.server_url = v;
        }
        if let Some(v) = lookup("DOCSYNC_LOCK_URL") {
            config.lock_api_url = v;
        }
        config.token = lookup("DOCSYNC_TOKEN").filter(|t| !t.is_empty());
        if let Some(ms) = lookup("DOCSYNC_HEARTBEAT_MS").and_then(|v| v.parse().ok()) {
            config.transport.heartbeat_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = lookup("DOCSYNC_LOCK_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            config.lock_request_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = lookup("DOCSYNC_LOCK_RENEW_MS").and_then(|v| v.parse().ok()) {
            config.lock_renew_interval = Duration::from_millis(ms);
        }
        config
    }
}

pub(crate) fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = CollabConfig::default();
        assert!(!config.collaborative);
        assert_eq!(config.transport.liveness_timeout(), Duration::from_secs(15));
        assert_eq!(config.transport.awareness_timeout(), Duration::from_secs(15));
    }

    #[test]
    fn test_from_lookup_overrides() {
        let vars: HashMap<&str, &str> = [
            ("DOCSYNC_COLLABORATIVE", "TRUE"),
            ("DOCSYNC_SERVER_URL", "ws://relay:1"),
            ("DOCSYNC_TOKEN", "secret"),
            ("DOCSYNC_HEARTBEAT_MS", "250"),
            ("DOCSYNC_LOCK_RENEW_MS", "2000"),
        ]
        .into_iter()
        .collect();
        let config = CollabConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));

        assert!(config.collaborative);
        assert_eq!(config.server_url, "ws://relay:1");
        assert_eq!(config.lock_api_url, CollabConfig::default().lock_api_url);
        assert_eq!(config.token.as_deref(), Some("secret"));
        assert_eq!(config.transport.heartbeat_interval, Duration::from_millis(250));
        assert_eq!(config.lock_renew_interval, Duration::from_secs(2));
    }

    #[test]
    fn test_parse_flag() {
        assert!(parse_flag("1"));
        assert!(parse_flag(" yes "));
        assert!(!parse_flag("0"));
        assert!(!parse_flag("off"));
    }
}
