// Relay engine configuration.
//
// Everything has a sensible default, so `RelayConfig::default()` is enough
// for most callers. The `relay` binary can also read a JSON file:
//
//   { "bind_host": "127.0.0.1", "idle_interval_ms": 2, "receive_chunk": 256,
//     "inbox_limit": 65536 }
//
// Missing keys fall back to their defaults.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::RelayError;

/// Default byte cap for inboxes the application may never drain.
pub const DEFAULT_INBOX_LIMIT: usize = 64 * 1024;

/// Tuning knobs for a `RelayEngine`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Interface the authority listens on. `None` listens on all of them.
    pub bind_host: Option<String>,
    /// How long a worker sleeps after a pass that moved no bytes.
    pub idle_interval_ms: u64,
    /// Upper bound on bytes taken from a socket per read.
    pub receive_chunk: usize,
    /// Bytes a remote's mirror inbox or the loopback's general inbox may
    /// hold before its oldest frames are dropped. Raised to at least one
    /// full frame.
    pub inbox_limit: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_host: None,
            idle_interval_ms: 2,
            receive_chunk: 256,
            inbox_limit: DEFAULT_INBOX_LIMIT,
        }
    }
}

impl RelayConfig {
    pub fn from_json(json: &str) -> Result<Self, RelayError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RelayError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms)
    }

    /// `receive_chunk`, but never zero.
    pub fn chunk_size(&self) -> usize {
        self.receive_chunk.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_gives_defaults() {
        let config = RelayConfig::from_json("{}").unwrap();
        assert_eq!(config, RelayConfig::default());
    }

    #[test]
    fn partial_json_overrides() {
        let config = RelayConfig::from_json(r#"{"bind_host":"127.0.0.1","receive_chunk":0}"#).unwrap();
        assert_eq!(config.bind_host.as_deref(), Some("127.0.0.1"));
        assert_eq!(config.idle_interval_ms, 2);
        assert_eq!(config.chunk_size(), 1);
        assert_eq!(config.inbox_limit, DEFAULT_INBOX_LIMIT);
    }

    #[test]
    fn malformed_json_is_config_error() {
        let err = RelayConfig::from_json("{not json").unwrap_err();
        assert!(matches!(err, RelayError::Config(_)));
    }
}
