//! # Configuration Management Module
//!
//! Persistent settings stored in platform-appropriate locations.
//! Handles loading, saving, and providing defaults for configuration options.
//!
//! ## Settings
//! - `data_dir`: Root directory under which dataset ids are resolved
//! - `check_sum`: Capture a checksum byte per sample in new datasets
//! - `username`: Recorded as `last_update_username` when a dataset is saved
//! - `load_retries`: Attempts made to read a blob before reporting corruption
//! - `live_quality`: Collapse quality fractions to a single dominant color
//!
//! ## Storage Location
//! - macOS: ~/Library/Application Support/rawdata/config.toml
//! - Linux: ~/.config/rawdata/config.toml
//! - Windows: %APPDATA%\rawdata\config.toml

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_LOAD_RETRIES: u32 = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data_dir: PathBuf,
    pub check_sum: bool,
    pub username: String,
    pub load_retries: u32,
    pub live_quality: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("rawdata"),
            check_sum: false,
            username: std::env::var("USER").unwrap_or_else(|_| "unknown".to_string()),
            load_retries: DEFAULT_LOAD_RETRIES,
            live_quality: false,
        }
    }
}

impl Config {
    /// Get the path to the config file
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("rawdata")
            .join("config.toml")
    }

    /// Load config from the default location, or create it if it doesn't exist
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path())
    }

    /// Load config from `path`, writing defaults there if the file is missing
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(contents) => {
                let config = toml::from_str(&contents).map_err(ConfigError::ParseFailed)?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = Self::default();
                config.save_to(path)?;
                log::info!("Created default config at {}", path.display());
                Ok(config)
            }
            Err(e) => Err(ConfigError::ReadFailed(e)),
        }
    }

    /// Save config to the default location
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(ConfigError::WriteFailed)?;
        }

        let toml_string = toml::to_string_pretty(self).map_err(ConfigError::SerializeFailed)?;
        fs::write(path, toml_string).map_err(ConfigError::WriteFailed)?;

        Ok(())
    }

    /// Directory of the dataset with the given session id
    pub fn dataset_dir(&self, id: &str) -> PathBuf {
        self.data_dir.join(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(!config.check_sum);
        assert!(!config.live_quality);
        assert_eq!(config.load_retries, DEFAULT_LOAD_RETRIES);
        assert!(config.data_dir.ends_with("rawdata"));
    }

    #[test]
    fn test_config_serialization() {
        let config = Config {
            data_dir: PathBuf::from("/srv/sessions"),
            check_sum: true,
            username: "lab".to_string(),
            load_retries: 3,
            live_quality: true,
        };

        let toml_str = toml::to_string(&config).expect("Failed to serialize");
        assert!(toml_str.contains("check_sum = true"));
        assert!(toml_str.contains("load_retries = 3"));
    }

    #[test]
    fn test_config_deserialization_fills_missing_fields() {
        let toml_str = r#"
            data_dir = "/srv/sessions"
            live_quality = true
        "#;

        let config: Config = toml::from_str(toml_str).expect("Failed to deserialize");
        assert_eq!(config.data_dir, PathBuf::from("/srv/sessions"));
        assert!(config.live_quality);
        assert_eq!(config.load_retries, DEFAULT_LOAD_RETRIES);
    }

    #[test]
    fn test_config_load_creates_default() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = Config::load_from(&path).expect("Failed to load config");
        assert!(path.exists());
        assert_eq!(config, Config::load_from(&path).unwrap());
    }

    #[test]
    fn test_config_rejects_garbage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "load_retries = \"many\"").unwrap();

        assert!(matches!(
            Config::load_from(&path),
            Err(ConfigError::ParseFailed(_))
        ));
    }

    #[test]
    fn test_dataset_dir() {
        let config = Config {
            data_dir: PathBuf::from("/srv/sessions"),
            ..Config::default()
        };
        assert_eq!(config.dataset_dir("abc"), PathBuf::from("/srv/sessions/abc"));
    }
}
