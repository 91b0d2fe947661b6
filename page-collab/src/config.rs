//! Client configuration.

use std::time::Duration;

use serde::Deserialize;

use crate::error::CollabResult;

/// Collaboration client configuration.
///
/// All durations are stored in milliseconds so the struct can be loaded
/// straight from JSON settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CollabConfig {
    /// Base WebSocket URL; the document id is appended as a path segment.
    pub server_url: String,
    /// Fallback timer for the first full sync.
    pub sync_timeout_ms: u64,
    /// Consecutive failures before first sync that count as a denial.
    pub denial_threshold: u32,
    /// First reconnect delay.
    pub reconnect_base_delay_ms: u64,
    /// Reconnect delay cap.
    pub reconnect_max_delay_ms: u64,
    /// Local updates buffered while disconnected.
    pub offline_queue_capacity: usize,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090".to_string(),
            sync_timeout_ms: 5_000,
            denial_threshold: 3,
            reconnect_base_delay_ms: 250,
            reconnect_max_delay_ms: 10_000,
            offline_queue_capacity: 10_000,
        }
    }
}

impl CollabConfig {
    /// Create a config pointing at the given server, defaults elsewhere.
    pub fn with_server(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Self::default()
        }
    }

    /// Parse a JSON object. Missing fields take their defaults.
    pub fn from_json(json: &str) -> CollabResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    /// Backoff before reconnect attempt `attempt` (1-based), doubling from
    /// the base delay up to the cap.
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let delay = self
            .reconnect_base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.reconnect_max_delay_ms);
        Duration::from_millis(delay)
    }

    /// URL for a specific document.
    pub fn document_url(&self, doc_id: &str) -> String {
        format!("{}/{}", self.server_url.trim_end_matches('/'), doc_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CollabConfig::default();
        assert_eq!(config.denial_threshold, 3);
        assert_eq!(config.sync_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_from_json_partial() {
        let config = CollabConfig::from_json(r#"{"sync_timeout_ms": 2000}"#).unwrap();
        assert_eq!(config.sync_timeout_ms, 2000);
        assert_eq!(config.server_url, CollabConfig::default().server_url);
    }

    #[test]
    fn test_from_json_rejects_unknown_field() {
        assert!(CollabConfig::from_json(r#"{"retries": 5}"#).is_err());
    }

    #[test]
    fn test_reconnect_delay_doubles_then_caps() {
        let config = CollabConfig {
            reconnect_base_delay_ms: 100,
            reconnect_max_delay_ms: 1_000,
            ..CollabConfig::default()
        };
        assert_eq!(config.reconnect_delay(1), Duration::from_millis(100));
        assert_eq!(config.reconnect_delay(2), Duration::from_millis(200));
        assert_eq!(config.reconnect_delay(4), Duration::from_millis(800));
        assert_eq!(config.reconnect_delay(5), Duration::from_millis(1_000));
        assert_eq!(config.reconnect_delay(60), Duration::from_millis(1_000));
    }

    #[test]
    fn test_document_url() {
        let config = CollabConfig::with_server("ws://localhost:9090/");
        assert_eq!(config.document_url("abc"), "ws://localhost:9090/abc");
    }
}
