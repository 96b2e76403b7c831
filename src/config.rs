//! Clock configuration
//!
//! Read from `clock.toml` in the Flick config directory:
//!
//! ```toml
//! mode = "fake"
//! ```
//!
//! `FLICK_CLOCK=real|fake` in the environment wins over the file.

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{clock::ClockMode, error::ClockError};

pub const MODE_ENV: &str = "FLICK_CLOCK";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    pub mode: ClockMode,
}

impl ClockConfig {
    /// Get the config file path
    pub fn config_path() -> Option<PathBuf> {
        std::env::var("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|_| std::env::var("HOME").map(|h| PathBuf::from(h).join(".config")))
            .ok()
            .map(|dir| dir.join("flick/clock.toml"))
    }

    /// Load config from the default location, or return default if not found.
    /// The environment override applies either way.
    pub fn load() -> Self {
        let mut config = Self::config_path()
            .filter(|path| path.exists())
            .and_then(|path| match Self::from_file(&path) {
                Ok(config) => {
                    tracing::info!("Loaded clock config from {:?}", path);
                    Some(config)
                }
                Err(e) => {
                    tracing::warn!("Ignoring clock config: {}", e);
                    None
                }
            })
            .unwrap_or_default();

        if let Ok(value) = std::env::var(MODE_ENV) {
            match parse_mode(&value) {
                Ok(mode) => config.mode = mode,
                Err(e) => tracing::warn!("Ignoring {}: {}", MODE_ENV, e),
            }
        }
        config
    }

    pub fn from_file(path: &Path) -> Result<Self, ClockError> {
        let contents = fs::read_to_string(path).map_err(|source| ClockError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&contents).map_err(|source| ClockError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }
}

pub fn parse_mode(value: &str) -> Result<ClockMode, ClockError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "real" => Ok(ClockMode::Real),
        "fake" => Ok(ClockMode::Fake),
        _ => Err(ClockError::UnknownMode(value.to_string())),
    }
}
