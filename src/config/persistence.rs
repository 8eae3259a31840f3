// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Configuration persistence (save/load).

use crate::config::HandoffConfig;
use crate::error::HandoffError;
use directories::ProjectDirs;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to determine config directory")]
    NoConfigDir,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("Invalid config: {0}")]
    Invalid(#[from] HandoffError),
}

/// Manages configuration file persistence.
pub struct ConfigManager {
    config_dir: PathBuf,
}

impl ConfigManager {
    /// Create a new config manager in the platform config directory.
    pub fn new() -> Result<Self, ConfigError> {
        let project_dirs =
            ProjectDirs::from("", "", "audio-handoff").ok_or(ConfigError::NoConfigDir)?;
        Self::with_dir(project_dirs.config_dir())
    }

    /// Create a config manager rooted at an explicit directory.
    pub fn with_dir(dir: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config_dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&config_dir)?;
        Ok(Self { config_dir })
    }

    /// Get the path to the main config file.
    pub fn config_path(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    /// Load the handoff config, falling back to defaults when no file exists.
    pub fn load_config(&self) -> Result<HandoffConfig, ConfigError> {
        let path = self.config_path();
        if path.exists() {
            let config = load_from_path(&path)?;
            info!("Loaded handoff config from {}", path.display());
            Ok(config)
        } else {
            debug!("No config at {}, using defaults", path.display());
            Ok(HandoffConfig::default())
        }
    }

    /// Save the handoff config.
    pub fn save_config(&self, config: &HandoffConfig) -> Result<(), ConfigError> {
        config.validate()?;
        let content = config.to_toml()?;
        fs::write(self.config_path(), content)?;
        Ok(())
    }
}

/// Read and validate a config file at an arbitrary path.
pub fn load_from_path(path: &Path) -> Result<HandoffConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    let config = HandoffConfig::from_toml(&content)?;
    config.validate()?;
    Ok(config)
}
