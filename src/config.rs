//! Persisted CLI defaults
//!
//! Optional defaults live in ~/.tpot/config.json:
//!
//! ```json
//! {
//!   "tpotServer": "https://tpot.example.com",
//!   "authKey": "...",
//!   "subdomain": "my-app",
//!   "httpHost": "localhost:3000"
//! }
//! ```
//!
//! Command-line options override every value found here.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const CORRUPT_WARNING: &str =
    "WARNING: Your configuration file at ~/.tpot/config.json appears to be corrupt.";

/// Values read from the configuration file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredConfig {
    pub tpot_server: Option<String>,
    pub auth_key: Option<String>,
    pub subdomain: Option<String>,
    pub http_host: Option<String>,
}

/// Outcome of reading the configuration file
#[derive(Debug, PartialEq, Eq)]
pub enum LoadedConfig {
    Missing,
    Corrupt,
    Found(StoredConfig),
}

/// Configuration manager
pub struct ConfigManager;

impl ConfigManager {
    /// Get the config file path
    fn get_config_path() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Failed to get home directory")?;
        Ok(home.join(".tpot").join("config.json"))
    }

    /// Load defaults from the user's configuration file. A corrupt file is
    /// reported on stderr and otherwise ignored.
    pub fn load() -> Result<StoredConfig> {
        let path = Self::get_config_path()?;

        match Self::load_from(&path)? {
            LoadedConfig::Found(config) => Ok(config),
            LoadedConfig::Missing => Ok(StoredConfig::default()),
            LoadedConfig::Corrupt => {
                eprintln!("{}", CORRUPT_WARNING);
                Ok(StoredConfig::default())
            }
        }
    }

    /// Read and classify a configuration file
    pub fn load_from(path: &Path) -> Result<LoadedConfig> {
        let json = match fs::read_to_string(path) {
            Ok(json) => json,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(LoadedConfig::Missing),
            Err(e) => {
                return Err(e).context(format!("Failed to read config file: {:?}", path));
            }
        };

        let value: serde_json::Value = match serde_json::from_str(&json) {
            Ok(value) => value,
            Err(_) => return Ok(LoadedConfig::Corrupt),
        };

        if !value.is_object() {
            return Ok(LoadedConfig::Corrupt);
        }

        match serde_json::from_value(value) {
            Ok(config) => Ok(LoadedConfig::Found(config)),
            Err(_) => Ok(LoadedConfig::Corrupt),
        }
    }
}
