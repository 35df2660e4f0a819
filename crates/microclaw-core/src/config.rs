//! Stored device configuration.
//!
//! The configuration document is a flat JSON object holding the settings the
//! firmware needs after a fresh flash (Wi-Fi credentials, bot token, provider
//! keys, model names). It is read and written wholesale.
//!
//! Storage is abstracted behind [`ConfigStorage`] so the web layer, the flash
//! orchestrator and tests share one interface:
//! - [`FileConfigStorage`]: a JSON file on disk
//! - [`MemoryConfigStorage`]: an in-process document

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read configuration.
    #[error("Read error: {0}")]
    ReadError(String),
    /// Failed to write configuration.
    #[error("Write error: {0}")]
    WriteError(String),
    /// Configuration data is invalid.
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// The device configuration document.
///
/// Keys not modelled here are kept in `extra` so a round trip never drops
/// fields written by another tool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub wifi_ssid: String,
    pub wifi_password: String,
    pub telegram_token: String,
    pub gemini_key: String,
    pub groq_key: String,

    /// `gemini` or `groq`.
    pub assistant_provider: String,

    pub gemini_model: String,
    pub groq_model: String,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl DeviceConfig {
    /// True when nothing would be replayed to the device.
    pub fn is_empty(&self) -> bool {
        self.wifi_ssid.is_empty()
            && self.telegram_token.is_empty()
            && self.gemini_key.is_empty()
            && self.groq_key.is_empty()
            && self.assistant_provider.is_empty()
    }
}

/// Abstract configuration storage.
///
/// All methods are synchronous; the document is small and written rarely.
pub trait ConfigStorage: Send + Sync {
    /// Load the configuration document.
    fn load(&self) -> Result<DeviceConfig, ConfigError>;

    /// Replace the configuration document.
    fn save(&self, config: &DeviceConfig) -> Result<(), ConfigError>;
}

/// JSON file storage. A missing file reads as an empty document.
#[derive(Debug, Clone)]
pub struct FileConfigStorage {
    path: PathBuf,
}

impl FileConfigStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigStorage for FileConfigStorage {
    fn load(&self) -> Result<DeviceConfig, ConfigError> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(DeviceConfig::default()),
            Err(e) => return Err(ConfigError::ReadError(format!("{}: {}", self.path.display(), e))),
        };
        serde_json::from_str(&text).map_err(|e| ConfigError::InvalidData(e.to_string()))
    }

    fn save(&self, config: &DeviceConfig) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(config)
            .map_err(|e| ConfigError::WriteError(e.to_string()))?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::WriteError(format!("{}: {}", parent.display(), e)))?;
        }
        std::fs::write(&self.path, json)
            .map_err(|e| ConfigError::WriteError(format!("{}: {}", self.path.display(), e)))
    }
}

/// In-memory storage, used by tests and demo mode.
#[derive(Debug, Default)]
pub struct MemoryConfigStorage {
    data: RwLock<DeviceConfig>,
}

impl MemoryConfigStorage {
    pub fn new(config: DeviceConfig) -> Self {
        Self {
            data: RwLock::new(config),
        }
    }
}

impl ConfigStorage for MemoryConfigStorage {
    fn load(&self) -> Result<DeviceConfig, ConfigError> {
        Ok(self.data.read().unwrap_or_else(PoisonError::into_inner).clone())
    }

    fn save(&self, config: &DeviceConfig) -> Result<(), ConfigError> {
        *self.data.write().unwrap_or_else(PoisonError::into_inner) = config.clone();
        Ok(())
    }
}
