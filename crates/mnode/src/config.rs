//! Node configuration
//!
//! Loaded from TOML (or JSON) with every field defaulted, so an empty
//! file is a valid configuration.
//!
//! ```toml
//! [log]
//! level = "info"
//!
//! [firewall]
//! kill_switch = true
//! allow_urls = ["https://discovery.example.net"]
//!
//! [payments]
//! charge_period_secs = 60
//! ```

use mnode_firewall::FirewallConfig;
use mnode_payments::{PaymentsConfig, SettingsError};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("unsupported config format (expected .toml or .json)")]
    UnsupportedFormat,

    #[error("invalid payments config: {0}")]
    Payments(#[from] SettingsError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    Json,
}

impl ConfigFormat {
    fn from_path(path: &Path) -> Option<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Some(ConfigFormat::Toml),
            Some("json") => Some(ConfigFormat::Json),
            _ => None,
        }
    }
}

/// `[log]` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter, overridden by `RUST_LOG`
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub log: LogConfig,
    pub firewall: FirewallConfig,
    pub payments: PaymentsConfig,
}

impl NodeConfig {
    /// Load and validate, picking the format from the file extension
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let format = ConfigFormat::from_path(path).ok_or(ConfigError::UnsupportedFormat)?;
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content, format)
    }

    /// Parse and validate
    pub fn parse(content: &str, format: ConfigFormat) -> Result<Self, ConfigError> {
        let config: Self = match format {
            ConfigFormat::Toml => {
                toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?
            }
            ConfigFormat::Json => {
                serde_json::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.payments.charge_settings()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_is_default() {
        let config = NodeConfig::parse("", ConfigFormat::Toml).unwrap();
        assert_eq!(config, NodeConfig::default());
        assert_eq!(config.log.level, "info");
        assert!(config.firewall.enabled);
        assert_eq!(config.payments.charge_period_secs, 60);
    }

    #[test]
    fn test_toml_sections() {
        let content = r#"
            [log]
            level = "debug"

            [firewall]
            kill_switch = true
            use_sudo = false
            allow_urls = ["https://discovery.example.net/api"]

            [payments]
            charge_period_secs = 30
            promise_wait_timeout_secs = 10
            missed_promise_leeway_secs = 90
        "#;
        let config = NodeConfig::parse(content, ConfigFormat::Toml).unwrap();
        assert_eq!(config.log.level, "debug");
        assert!(config.firewall.kill_switch);
        assert!(!config.firewall.use_sudo);
        assert_eq!(config.firewall.allow_urls.len(), 1);
        // untouched fields keep defaults
        assert_eq!(config.firewall.outbound_ip, "0.0.0.0/0");

        let settings = config.payments.charge_settings().unwrap();
        assert_eq!(settings.max_missed_promises(), 3);
    }

    #[test]
    fn test_json() {
        let content = r#"{"firewall": {"enabled": false}, "payments": {"price_per_minute": 7}}"#;
        let config = NodeConfig::parse(content, ConfigFormat::Json).unwrap();
        assert!(!config.firewall.enabled);
        assert_eq!(config.payments.price_per_minute, 7);
    }

    #[test]
    fn test_rejects_bad_payments() {
        let content = "[payments]\ncharge_period_secs = 10\npromise_wait_timeout_secs = 20\n";
        let err = NodeConfig::parse(content, ConfigFormat::Toml).unwrap_err();
        assert!(matches!(err, ConfigError::Payments(SettingsError::WaitTimeoutTooLong { .. })));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(matches!(
            NodeConfig::parse("[firewall\n", ConfigFormat::Toml),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            NodeConfig::parse(r#"{"firewall": {"enabled": "yes"}}"#, ConfigFormat::Json),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_format_from_extension() {
        assert_eq!(ConfigFormat::from_path(Path::new("mnode.toml")), Some(ConfigFormat::Toml));
        assert_eq!(ConfigFormat::from_path(Path::new("mnode.json")), Some(ConfigFormat::Json));
        assert!(matches!(
            NodeConfig::load(Path::new("mnode.yaml")),
            Err(ConfigError::UnsupportedFormat)
        ));
    }
}
