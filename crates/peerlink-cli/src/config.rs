//! Configuration loading for the PeerLink CLI

use peerlink_core::{LocalWallet, PeerlinkConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{CliError, Result};

/// Contents of the CLI configuration file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub identity: IdentitySettings,
    pub peerlink: PeerlinkConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentitySettings {
    /// Hex secret key; a fresh wallet is generated when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
}

impl CliConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        self.peerlink.validate().map_err(CliError::Config)?;
        if let Some(secret) = &self.identity.secret_key {
            LocalWallet::from_secret_hex(secret)?;
        }
        Ok(())
    }

    /// Wallet from the configured secret key, or a new one
    pub fn wallet(&self) -> Result<LocalWallet> {
        match &self.identity.secret_key {
            Some(secret) => Ok(LocalWallet::from_secret_hex(secret)?),
            None => Ok(LocalWallet::generate()),
        }
    }

    /// Apply command-line overrides on top of the file contents
    pub fn apply_overrides(
        &mut self,
        max_attempts: Option<u32>,
        connect_timeout_ms: Option<u64>,
    ) -> Result<()> {
        if let Some(attempts) = max_attempts {
            self.peerlink.connection.max_attempts = attempts;
        }
        if let Some(timeout) = connect_timeout_ms {
            self.peerlink.connection.connect_timeout = Duration::from_millis(timeout);
        }
        self.validate()
    }
}

/// `$CONFIG_DIR/peerlink/config.toml`, when the platform has a config directory
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("peerlink").join("config.toml"))
}

/// Load from `path`, else from the default location if present, else defaults
pub fn load(path: Option<&str>) -> Result<CliConfig> {
    if let Some(path) = path {
        return CliConfig::load_from_file(path);
    }
    match default_config_path() {
        Some(path) if path.exists() => CliConfig::load_from_file(path),
        _ => Ok(CliConfig::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_fills_defaults() {
        let config = CliConfig::from_toml(
            r#"
            [peerlink.connection]
            max_attempts = 5
            connect_timeout_ms = 1500
            "#,
        )
        .unwrap();

        assert_eq!(config.peerlink.connection.max_attempts, 5);
        assert_eq!(
            config.peerlink.connection.connect_timeout,
            Duration::from_millis(1500)
        );
        assert_eq!(config.peerlink.delivery, PeerlinkConfig::default().delivery);
        assert!(config.identity.secret_key.is_none());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let result = CliConfig::from_toml(
            r#"
            [peerlink.connection]
            max_attempts = 0
            "#,
        );
        assert!(matches!(result, Err(CliError::Config(_))));

        let result = CliConfig::from_toml(
            r#"
            [identity]
            secret_key = "not-hex"
            "#,
        );
        assert!(matches!(result, Err(CliError::Crypto(_))));
    }

    #[test]
    fn test_save_and_reload() {
        let wallet = LocalWallet::from_secret_bytes(&[9u8; 32]).unwrap();
        let mut config = CliConfig::default();
        config.identity.secret_key = Some(wallet.secret_hex());

        let dir = std::env::temp_dir().join(format!("peerlink-cli-{}", std::process::id()));
        let path = dir.join("config.toml");
        config.save_to_file(&path).unwrap();

        let loaded = CliConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.wallet().unwrap().address(), wallet.address());

        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_overrides_are_validated() {
        let mut config = CliConfig::default();
        config.apply_overrides(Some(7), Some(250)).unwrap();
        assert_eq!(config.peerlink.connection.max_attempts, 7);

        assert!(config.apply_overrides(Some(0), None).is_err());
    }
}
