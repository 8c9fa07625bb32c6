//! Application configuration management.
//!
//! This module handles loading and saving the CLI configuration: which
//! storage backend holds the session, the refresh endpoint, login defaults,
//! and where logs go.
//!
//! Configuration is stored at `~/.config/sessionkeep/config.json`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sessionkeep_core::auth::store::DEFAULT_ADMIN_USER_ID;
use sessionkeep_core::{SealedCodec, SessionConfig};

/// Application name used for config/data directory paths
pub const APP_NAME: &str = "sessionkeep";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Where the session is persisted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    File,
    Keyring,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub backend: Backend,
    /// Refresh endpoint; tokens are minted locally when unset
    pub refresh_url: Option<String>,
    /// Defaults applied to every login
    pub session: SessionConfig,
    /// `null` turns off the admin user bypass
    pub admin_user_id: Option<String>,
    /// Encrypt `secure_session` with a passphrase instead of plain encoding
    pub seal_with_passphrase: bool,
    /// Base64 salt for passphrase key derivation, generated on first use
    pub sealing_salt: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            refresh_url: None,
            session: SessionConfig::default(),
            admin_user_id: Some(DEFAULT_ADMIN_USER_ID.to_string()),
            seal_with_passphrase: false,
            sealing_salt: None,
            data_dir: None,
            log_dir: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Directory for the file storage backend
    pub fn data_dir(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.data_dir {
            return Ok(dir.clone());
        }
        let data_dir = dirs::data_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }

    /// The sealing salt, generating one if none is stored yet.
    /// Returns whether the config changed and needs saving.
    pub fn sealing_salt(&mut self) -> Result<(Vec<u8>, bool)> {
        if let Some(ref encoded) = self.sealing_salt {
            let salt = STANDARD
                .decode(encoded)
                .context("Invalid sealing_salt in config")?;
            return Ok((salt, false));
        }
        let salt = SealedCodec::generate_salt().to_vec();
        self.sealing_salt = Some(STANDARD.encode(&salt));
        Ok((salt, true))
    }
}
