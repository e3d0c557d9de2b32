//! Configuration types and loading

use std::fs;
use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use kvstore::{DEFAULT_HISTORY_CAPACITY, MemoryStore};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::coordinator::CoordinatorConfig;
use crate::error::CoordError;

/// Top-level configuration for the `tc` binary
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Coordinator settings shared by every simulated node
    pub coordinator: CoordinatorConfig,

    /// In-process store settings
    pub store: StoreConfig,
}

impl Config {
    /// Load configuration with fallback chain
    ///
    /// 1. Explicit path, if given
    /// 2. `./.taskcoord.yml`
    /// 3. `<config_dir>/taskcoord/taskcoord.yml`
    /// 4. Defaults
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        let local_config = PathBuf::from(".taskcoord.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("taskcoord").join("taskcoord.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        config.validate().context("Invalid config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CoordError> {
        self.coordinator.validate()?;
        self.store.validate()
    }
}

/// Settings for the in-process store used by `tc simulate`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Number of change events retained for watches
    #[serde(rename = "history-capacity", default = "default_history_capacity")]
    pub history_capacity: usize,
}

fn default_history_capacity() -> usize {
    debug!("default_history_capacity: called");
    DEFAULT_HISTORY_CAPACITY
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            history_capacity: DEFAULT_HISTORY_CAPACITY,
        }
    }
}

impl StoreConfig {
    pub fn build(&self) -> MemoryStore {
        MemoryStore::with_history_capacity(self.history_capacity)
    }

    pub fn validate(&self) -> Result<(), CoordError> {
        if self.history_capacity == 0 {
            return Err(CoordError::InvalidConfig("store.history-capacity must be positive".to_string()));
        }
        Ok(())
    }
}
