//! Per-device configuration
//!
//! Each device may have its own synthesis voice and system prompt. Lookups go
//! through a short-lived TTL cache shared by all sessions; entries are whole
//! values replaced atomically, so concurrent refreshes need no coordination.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use mini_moka::sync::Cache;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Voice used when neither the device nor the config file names one
pub const DEFAULT_VOICE_ID: &str = "7b057c33b9b241b282954ee216af9906";

/// Default cache lifetime for a device lookup
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60);

const CACHE_CAPACITY: u64 = 4096;

/// Synthesis voice and dialogue prompt for one device
///
/// Empty fields mean "use the process default".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default)]
    pub voice_id: String,
    #[serde(default)]
    pub system_prompt: String,
}

impl DeviceConfig {
    /// Fill empty fields from `defaults`
    #[must_use]
    pub fn resolve(self, defaults: &Self) -> Self {
        Self {
            voice_id: if self.voice_id.trim().is_empty() {
                defaults.voice_id.clone()
            } else {
                self.voice_id
            },
            system_prompt: if self.system_prompt.trim().is_empty() {
                defaults.system_prompt.clone()
            } else {
                self.system_prompt
            },
        }
    }
}

/// Backing store of device configurations
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    /// Look up a device, `None` if unknown
    async fn fetch(&self, device_id: &str) -> Result<Option<DeviceConfig>>;

    /// Store a device's configuration
    async fn update(&self, device_id: &str, config: DeviceConfig) -> Result<()>;
}

/// In-memory directory, optionally seeded from a TOML file
///
/// The file maps device ids to tables:
///
/// ```toml
/// [AABBCC]
/// voice_id = "..."
/// system_prompt = "..."
/// ```
#[derive(Debug, Default)]
pub struct StaticDeviceDirectory {
    devices: RwLock<HashMap<String, DeviceConfig>>,
}

impl StaticDeviceDirectory {
    /// Create an empty directory
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a directory from known devices
    #[must_use]
    pub fn from_devices(devices: HashMap<String, DeviceConfig>) -> Self {
        Self {
            devices: RwLock::new(devices),
        }
    }

    /// Parse a devices table
    ///
    /// # Errors
    ///
    /// Returns error if the TOML is invalid
    pub fn parse(content: &str) -> Result<Self> {
        let devices: HashMap<String, DeviceConfig> = toml::from_str(content)?;
        Ok(Self::from_devices(devices))
    }

    /// Load a devices file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read devices file {}: {e}", path.display()))
        })?;
        let directory = Self::parse(&content)?;
        tracing::info!(
            path = %path.display(),
            devices = directory.len(),
            "loaded device directory"
        );
        Ok(directory)
    }

    /// Number of known devices
    #[must_use]
    pub fn len(&self) -> usize {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no devices are known
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DeviceDirectory for StaticDeviceDirectory {
    async fn fetch(&self, device_id: &str) -> Result<Option<DeviceConfig>> {
        Ok(self
            .devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(device_id)
            .cloned())
    }

    async fn update(&self, device_id: &str, config: DeviceConfig) -> Result<()> {
        self.devices
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(device_id.to_string(), config);
        Ok(())
    }
}

/// Read-through TTL cache over a [`DeviceDirectory`]
#[derive(Clone)]
pub struct DeviceConfigService {
    directory: Arc<dyn DeviceDirectory>,
    defaults: DeviceConfig,
    cache: Cache<String, DeviceConfig>,
}

impl DeviceConfigService {
    /// Create a service caching lookups for `ttl`
    #[must_use]
    pub fn new(directory: Arc<dyn DeviceDirectory>, defaults: DeviceConfig, ttl: Duration) -> Self {
        Self {
            directory,
            defaults,
            cache: Cache::builder()
                .max_capacity(CACHE_CAPACITY)
                .time_to_live(ttl)
                .build(),
        }
    }

    /// Process-wide default configuration
    #[must_use]
    pub const fn defaults(&self) -> &DeviceConfig {
        &self.defaults
    }

    /// Resolved configuration for a device
    ///
    /// Never fails: unknown devices get the defaults (cached like any hit);
    /// directory errors also yield the defaults but are not cached.
    pub async fn get(&self, device_id: &str) -> DeviceConfig {
        if let Some(config) = self.cache.get(&device_id.to_string()) {
            return config;
        }

        match self.directory.fetch(device_id).await {
            Ok(found) => {
                let known = found.is_some();
                let config = found.unwrap_or_default().resolve(&self.defaults);
                tracing::debug!(device_id, known, "device config loaded");
                self.set(device_id, config.clone());
                config
            }
            Err(e) => {
                tracing::warn!(device_id, error = %e, "device lookup failed, using defaults");
                self.defaults.clone()
            }
        }
    }

    /// Replace the cached configuration for a device
    pub fn set(&self, device_id: &str, config: DeviceConfig) {
        self.cache.insert(device_id.to_string(), config);
    }

    /// Drop one device's cached entry, or every entry when `device_id` is `None`
    pub fn invalidate(&self, device_id: Option<&str>) {
        match device_id {
            Some(id) => self.cache.invalidate(&id.to_string()),
            None => self.cache.invalidate_all(),
        }
    }

    /// Store a device's configuration and invalidate its cached entry
    ///
    /// # Errors
    ///
    /// Returns error if the directory rejects the update
    pub async fn update(&self, device_id: &str, config: DeviceConfig) -> Result<()> {
        self.directory.update(device_id, config).await?;
        self.invalidate(Some(device_id));
        Ok(())
    }
}
