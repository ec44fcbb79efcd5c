//! Configuration management for Hawser

mod agent;
pub mod serde_utils;

pub use agent::{AdminConfig, AgentConfig, BackoffConfig, UpdateConfig};

use crate::error::ConfigError;
use std::path::{Path, PathBuf};

/// Get the default configuration directory
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("hawser")
}

/// Get the default configuration file path
pub fn default_config_path() -> PathBuf {
    default_config_dir().join("agent.toml")
}

/// Load configuration from a file
pub fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Invalid(format!("Failed to read config: {}", e)))?;

    let config: T = toml::from_str(&content)?;
    Ok(config)
}

/// Save configuration to a file
pub fn save_config<T: serde::Serialize>(path: &Path, config: &T) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(config)?;

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| ConfigError::Invalid(format!("Failed to create config dir: {}", e)))?;
    }

    std::fs::write(path, content)
        .map_err(|e| ConfigError::Invalid(format!("Failed to write config: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_load_missing_config() {
        let dir = tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("missing.toml");

        let result: Result<AgentConfig, _> = load_config(&path);
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("agent.toml");

        let mut config = AgentConfig::default();
        config.server_address = "plane.example.net:7500".to_string();
        config.send_queue_capacity = 250;

        save_config(&path, &config).expect("Failed to save");
        let loaded: AgentConfig = load_config(&path).expect("Failed to load");

        assert_eq!(loaded.server_address, "plane.example.net:7500");
        assert_eq!(loaded.send_queue_capacity, 250);
        assert_eq!(loaded.heartbeat_interval, config.heartbeat_interval);
    }
}
