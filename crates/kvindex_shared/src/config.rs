//! # Service Configuration
//!
//! Loaded once at startup from a TOML file.
//!
//! ```toml
//! shm_dir = "/dev/shm"
//!
//! [[namespaces]]
//! name = "test"
//! max_ttl = 2592000
//!
//! [namespaces.storage]
//! engine = "device"
//!
//! [[namespaces.storage.devices]]
//! name = "/dev/nvme0n1"
//! file_id = 0
//! size = 17179869184
//!
//! [[namespaces.sets]]
//! name = "users"
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constants::{DEFAULT_WRITE_BLOCK_SIZE, SET_NAME_MAX_SIZE};

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("cannot read config {path}: {source}")]
    Io {
        /// Path that failed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The TOML did not parse into the configuration schema.
    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// The configuration parsed but is not usable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Storage engine backing a namespace.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageEngine {
    /// Records live on devices; the index is kept in persistent memory.
    #[default]
    Device,
    /// Records live in process memory only.
    Memory,
}

/// One storage device of a namespace.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device path or name, used in logs.
    pub name: String,
    /// Identifier stored in every index entry that lives on this device.
    pub file_id: u32,
    /// Usable device size in bytes.
    pub size: u64,
    /// Write-block size in bytes.
    #[serde(default = "default_write_block_size")]
    pub write_block_size: u32,
}

fn default_write_block_size() -> u32 {
    DEFAULT_WRITE_BLOCK_SIZE
}

/// Storage section of a namespace.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Storage engine.
    #[serde(default)]
    pub engine: StorageEngine,
    /// Whether a device-backed namespace also keeps record data in memory.
    #[serde(default)]
    pub data_in_memory: bool,
    /// Devices backing the namespace.
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

impl StorageConfig {
    /// Whether the index of this namespace survives a restart.
    #[inline]
    #[must_use]
    pub fn uses_persistent_index(&self) -> bool {
        self.engine == StorageEngine::Device && !self.data_in_memory
    }
}

/// A set declared in configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetConfig {
    /// Set name.
    pub name: String,
    /// Object count above which writes to the set stop (0 = unlimited).
    #[serde(default)]
    pub stop_writes_count: u64,
    /// Whether eviction skips this set.
    #[serde(default)]
    pub disable_eviction: bool,
}

/// Configuration of one namespace.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceConfig {
    /// Namespace name.
    pub name: String,
    /// Storage section.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Whether records carry a single unnamed bin.
    #[serde(default)]
    pub single_bin: bool,
    /// Maximum record time-to-live in seconds (0 = unlimited).
    #[serde(default)]
    pub max_ttl: u32,
    /// Sets to register at startup.
    #[serde(default)]
    pub sets: Vec<SetConfig>,
}

impl NamespaceConfig {
    /// Creates a memory-resident namespace configuration.
    #[must_use]
    pub fn memory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            storage: StorageConfig {
                engine: StorageEngine::Memory,
                ..StorageConfig::default()
            },
            single_bin: false,
            max_ttl: 0,
            sets: Vec::new(),
        }
    }

    /// Creates a device-backed namespace configuration.
    #[must_use]
    pub fn device(name: impl Into<String>, devices: Vec<DeviceConfig>) -> Self {
        Self {
            name: name.into(),
            storage: StorageConfig {
                engine: StorageEngine::Device,
                data_in_memory: false,
                devices,
            },
            single_bin: false,
            max_ttl: 0,
            sets: Vec::new(),
        }
    }
}

/// Top-level service configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Directory holding shared memory segments.
    #[serde(default = "default_shm_dir")]
    pub shm_dir: PathBuf,
    /// Discard persisted index memory and start every namespace cold.
    #[serde(default)]
    pub cold_start: bool,
    /// Instance number of this node on the host.
    #[serde(default)]
    pub instance: u32,
    /// Configured namespaces, in id order (the first has id 1).
    pub namespaces: Vec<NamespaceConfig>,
}

fn default_shm_dir() -> PathBuf {
    PathBuf::from("/dev/shm")
}

impl ServiceConfig {
    /// Parses and validates a configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text does not parse or fails validation.
    pub fn from_toml_str(text: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Checks cross-field constraints serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first violation.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.namespaces.is_empty() {
            return Err(ConfigError::Invalid("no namespaces configured".to_string()));
        }

        let mut names = HashSet::new();
        for ns in &self.namespaces {
            if ns.name.is_empty() {
                return Err(ConfigError::Invalid("namespace with empty name".to_string()));
            }
            if !names.insert(ns.name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate namespace {}", ns.name)));
            }
            if ns.storage.engine == StorageEngine::Device && ns.storage.devices.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "ns {} uses device storage but has no devices",
                    ns.name
                )));
            }

            let mut file_ids = HashSet::new();
            for device in &ns.storage.devices {
                if device.write_block_size == 0 || device.size < u64::from(device.write_block_size) {
                    return Err(ConfigError::Invalid(format!(
                        "ns {} device {} smaller than one write block",
                        ns.name, device.name
                    )));
                }
                if !file_ids.insert(device.file_id) {
                    return Err(ConfigError::Invalid(format!(
                        "ns {} repeats device file id {}",
                        ns.name, device.file_id
                    )));
                }
            }

            for set in &ns.sets {
                if set.name.is_empty() || set.name.len() >= SET_NAME_MAX_SIZE as usize {
                    return Err(ConfigError::Invalid(format!(
                        "ns {} set name {:?} must be 1..{} bytes",
                        ns.name,
                        set.name,
                        SET_NAME_MAX_SIZE - 1
                    )));
                }
            }
        }

        Ok(())
    }
}
