//! Gateway configuration
//!
//! Loaded from a JSON file. Every field has a default, so a partial file (or
//! `{}`) is a valid configuration.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::manager::ManagerConfig;
use crate::protocol::LinkConfig;
use crate::registry::JsonRegistry;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Complete gateway configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Dongle connection
    pub link: LinkConfig,
    /// Communication manager timing
    pub manager: ManagerConfig,
    /// Device registry file; the app data directory when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registry_path: Option<PathBuf>,
}

impl GatewayConfig {
    /// Read and validate a JSON configuration file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Write as pretty JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.link
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        if self.manager.health_window == 0 {
            return Err(ConfigError::Invalid("health window must be non-zero".into()));
        }
        if self.manager.event_capacity == 0 {
            return Err(ConfigError::Invalid("event capacity must be non-zero".into()));
        }
        Ok(())
    }

    /// Registry file to open
    pub fn registry_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.registry_path {
            Some(path) => Ok(path.clone()),
            None => Ok(JsonRegistry::default_path()?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Framing;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    #[test]
    fn test_empty_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gateway.json");
        fs::write(&path, "{}").unwrap();

        let config = GatewayConfig::load(&path).unwrap();
        assert_eq!(config, GatewayConfig::default());
        assert_eq!(config.link.baud_rate, 115200);
        assert_eq!(config.link.channel, 101);
        assert_eq!(config.manager.offline_timeout_ms, 5000);
    }

    #[test]
    fn test_partial_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gateway.json");
        fs::write(
            &path,
            r#"{"link": {"port_name": "/dev/ttyACM1", "framing": "binary"}, "registry_path": "/tmp/reg.json"}"#,
        )
        .unwrap();

        let config = GatewayConfig::load(&path).unwrap();
        assert_eq!(config.link.port_name, "/dev/ttyACM1");
        assert_eq!(config.link.framing, Framing::Binary);
        assert_eq!(config.link.ack_timeout_ms, 500);
        assert_eq!(config.registry_path().unwrap(), PathBuf::from("/tmp/reg.json"));
    }

    #[test]
    fn test_save_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gateway.json");
        let mut config = GatewayConfig::default();
        config.link.channel = 42;
        config.manager.send_pacing_ms = 50;
        config.save(&path).unwrap();
        assert_eq!(GatewayConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_invalid_channel_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gateway.json");
        fs::write(&path, r#"{"link": {"channel": 200}}"#).unwrap();
        assert!(matches!(
            GatewayConfig::load(&path),
            Err(ConfigError::Invalid(_))
        ));

        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(GatewayConfig::load(&path), Err(ConfigError::Parse(_))));
    }
}
