//! Client configuration.
//!
//! Configuration is stored at `~/.config/forgebase-admin/config.json`. The API
//! URL can be overridden with the `FORGEBASE_API_URL` environment variable.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::auth::session::DEFAULT_SESSION_MAX_AGE_DAYS;
use crate::auth::storage::STORAGE_NAMESPACE;

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Environment variable overriding the API base URL
pub const API_URL_ENV: &str = "FORGEBASE_API_URL";

/// Backend used when nothing is configured
const DEFAULT_API_URL: &str = "http://localhost:8080";

/// HTTP request timeout in seconds.
/// A timeout is reported like any other network failure.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    File,
    Keyring,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub api_url: Option<String>,
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
    #[serde(default)]
    pub storage: StorageBackend,
    #[serde(default)]
    pub session_max_age_days: Option<i64>,
    #[serde(default = "default_true")]
    pub revoke_on_logout: bool,
    #[serde(default)]
    pub last_email: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: None,
            request_timeout_secs: None,
            storage: StorageBackend::default(),
            session_max_age_days: None,
            revoke_on_logout: true,
            last_email: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            Ok(serde_json::from_str(&contents)?)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
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
        Ok(config_dir.join(STORAGE_NAMESPACE).join(CONFIG_FILE))
    }

    /// Directory holding the session file
    pub fn data_dir(&self) -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(STORAGE_NAMESPACE))
    }

    /// Base URL: environment, then config file, then the local default
    pub fn api_url(&self) -> String {
        std::env::var(API_URL_ENV)
            .ok()
            .filter(|url| !url.trim().is_empty())
            .or_else(|| self.api_url.clone())
            .unwrap_or_else(|| DEFAULT_API_URL.to_string())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(
            self.request_timeout_secs
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
        )
    }

    pub fn session_max_age(&self) -> chrono::Duration {
        chrono::Duration::days(
            self.session_max_age_days
                .unwrap_or(DEFAULT_SESSION_MAX_AGE_DAYS),
        )
    }
}
