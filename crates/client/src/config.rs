// Client configuration file.
//
// Global config: `~/.decksync/client.toml`

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transport::ReconnectPolicy;

/// Root directory for decksync client state: `~/.decksync/`.
pub fn global_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".decksync"))
}

/// Path to the client config file: `~/.decksync/client.toml`.
pub fn global_config_path() -> Option<PathBuf> {
    global_dir().map(|dir| dir.join("client.toml"))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Relay base URL (e.g. `wss://relay.example.com`).
    pub relay_url: String,
    /// Loaded shards allowed outside the visible set before LRU eviction.
    pub max_loaded_documents: usize,
    /// Shards made visible by `initialize`.
    pub initial_batch: usize,
    pub handshake_timeout_ms: u64,
    pub presence_throttle_ms: u64,
    pub presence_ttl_ms: u64,
    pub presence_sweep_interval_ms: u64,
    pub reconnect: ReconnectConfig,
    pub identity: IdentityConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://127.0.0.1:8080".into(),
            max_loaded_documents: 5,
            initial_batch: 1,
            handshake_timeout_ms: 10_000,
            presence_throttle_ms: 16,
            presence_ttl_ms: 30_000,
            presence_sweep_interval_ms: 1_000,
            reconnect: ReconnectConfig::default(),
            identity: IdentityConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Load from `~/.decksync/client.toml`. Returns defaults if the file
    /// doesn't exist or can't be parsed.
    pub fn load() -> Self {
        global_config_path().and_then(|path| Self::load_from(&path).ok()).unwrap_or_default()
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Save to a specific path (creates parent directories).
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn presence_throttle(&self) -> Duration {
        Duration::from_millis(self.presence_throttle_ms)
    }

    pub fn presence_ttl(&self) -> Duration {
        Duration::from_millis(self.presence_ttl_ms)
    }

    pub fn presence_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.presence_sweep_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReconnectConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self { base_delay_ms: 250, max_delay_ms: 30_000, max_attempts: u32::MAX }
    }
}

impl ReconnectConfig {
    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            max_attempts: self.max_attempts,
        }
    }
}

/// How this client appears to peers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IdentityConfig {
    pub display_name: String,
    /// CSS colour; derived from the client id when unset.
    pub color: Option<String>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self { display_name: "Anonymous".into(), color: None }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("config serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults() {
        let cfg = ClientConfig::default();
        assert_eq!(cfg.max_loaded_documents, 5);
        assert_eq!(cfg.handshake_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.presence_throttle(), Duration::from_millis(16));
        assert_eq!(cfg.presence_ttl(), Duration::from_secs(30));
        assert_eq!(cfg.reconnect.max_attempts, u32::MAX);
        assert!(cfg.identity.color.is_none());
    }

    #[test]
    fn roundtrip_through_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("client.toml");

        let cfg = ClientConfig {
            relay_url: "wss://relay.example.com".into(),
            max_loaded_documents: 2,
            identity: IdentityConfig { display_name: "Ada".into(), color: Some("#336699".into()) },
            ..ClientConfig::default()
        };
        cfg.save_to(&path).unwrap();
        assert_eq!(ClientConfig::load_from(&path).unwrap(), cfg);
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let toml_str = r#"
relay_url = "ws://localhost:9000"

[reconnect]
max_attempts = 4
"#;
        let cfg: ClientConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.relay_url, "ws://localhost:9000");
        assert_eq!(cfg.reconnect.max_attempts, 4);
        assert_eq!(cfg.reconnect.base_delay_ms, 250);
        assert_eq!(cfg.presence_ttl_ms, 30_000);
        assert_eq!(cfg.identity.display_name, "Anonymous");
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let result = ClientConfig::load_from(&dir.path().join("missing.toml"));
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }

    #[test]
    fn reconnect_config_builds_policy() {
        let policy = ReconnectConfig { base_delay_ms: 100, max_delay_ms: 800, max_attempts: 3 }.policy();
        assert_eq!(policy.base_delay, Duration::from_millis(100));
        assert_eq!(policy.max_delay, Duration::from_millis(800));
        assert_eq!(policy.max_attempts, 3);
    }
}
