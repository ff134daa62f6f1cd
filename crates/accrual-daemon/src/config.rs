//! Configuration loading and management

use std::path::Path;

use accrual_core::DetectorConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// How a heartbeat is mapped to a peer identity. One strategy per deployment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum IdentityStrategy {
    /// The `token` carried in the beat payload
    #[default]
    Token,
    /// The remote socket address of the connection
    TransportAddress,
}

/// Main configuration for the heartbeat daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Address to listen on for heartbeat connections
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Identity extraction strategy
    #[serde(default)]
    pub identity: IdentityStrategy,

    /// Detector, registry and sweeper settings
    #[serde(default)]
    pub detector: DetectorConfig,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            identity: IdentityStrategy::default(),
            detector: DetectorConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from the config directory
    pub fn load(config_path: &Path) -> Result<Self> {
        let config_file = config_path.join("config.json");

        let config = if config_file.exists() {
            let content = std::fs::read_to_string(&config_file)
                .with_context(|| format!("Failed to read config file: {:?}", config_file))?;
            let config: DaemonConfig = serde_json::from_str(&content)
                .with_context(|| "Failed to parse config.json")?;
            tracing::info!("Loaded configuration from {:?}", config_file);
            config
        } else {
            tracing::info!("No config file found at {:?}, using defaults", config_file);
            let config = DaemonConfig::default();

            std::fs::create_dir_all(config_path)
                .with_context(|| format!("Failed to create config directory: {:?}", config_path))?;

            // Write default config for reference
            let content = serde_json::to_string_pretty(&config)?;
            std::fs::write(&config_file, content)
                .with_context(|| format!("Failed to write default config: {:?}", config_file))?;
            tracing::info!("Created default config at {:?}", config_file);

            config
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.detector
            .validate()
            .context("Invalid detector configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use accrual_core::TimeUnit;
    use tempfile::TempDir;

    #[test]
    fn test_load_missing_writes_defaults() {
        let dir = TempDir::new().unwrap();
        let config = DaemonConfig::load(dir.path()).unwrap();

        assert_eq!(config.listen, "0.0.0.0:8080");
        assert_eq!(config.identity, IdentityStrategy::Token);
        assert!(dir.path().join("config.json").exists());

        // Written defaults load back identically
        let reloaded = DaemonConfig::load(dir.path()).unwrap();
        assert_eq!(reloaded.detector, config.detector);
    }

    #[test]
    fn test_load_partial_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("config.json"),
            r#"{
                "identity": "transport_address",
                "detector": { "window_size": 1000, "time_unit": "seconds" }
            }"#,
        )
        .unwrap();

        let config = DaemonConfig::load(dir.path()).unwrap();
        assert_eq!(config.identity, IdentityStrategy::TransportAddress);
        assert_eq!(config.detector.window_size, 1000);
        assert_eq!(config.detector.time_unit, TimeUnit::Seconds);
        assert_eq!(config.detector.grace_period_ms, 10_000);
        assert_eq!(config.listen, "0.0.0.0:8080");
    }

    #[test]
    fn test_load_rejects_zero_window() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("config.json"),
            r#"{ "detector": { "window_size": 0 } }"#,
        )
        .unwrap();

        let err = DaemonConfig::load(dir.path()).unwrap_err();
        assert!(format!("{:#}", err).contains("window_size"));
    }

    #[test]
    fn test_load_rejects_single_interval_window() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("config.json"),
            r#"{ "detector": { "window_size": 1 } }"#,
        )
        .unwrap();

        let err = DaemonConfig::load(dir.path()).unwrap_err();
        assert!(format!("{:#}", err).contains("at least 2"));
    }

    #[test]
    fn test_validate_catches_override_after_load() {
        let dir = TempDir::new().unwrap();
        let mut config = DaemonConfig::load(dir.path()).unwrap();

        // As applied from the command line after loading.
        config.detector.sweep_interval_ms = 0;
        let err = config.validate().unwrap_err();
        assert!(format!("{:#}", err).contains("sweep_interval_ms"));
    }

    #[test]
    fn test_load_rejects_invalid_json() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("config.json"), "{ not json").unwrap();

        assert!(DaemonConfig::load(dir.path()).is_err());
    }

    #[test]
    fn test_creates_missing_directory() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("nested").join("config");

        DaemonConfig::load(&nested).unwrap();
        assert!(nested.join("config.json").exists());
    }
}
