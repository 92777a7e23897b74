//! Configuration loading and validation
//!
//! The configuration file names the system and lists its devices. Each
//! device entry is discriminated by its `brand`, which decides the
//! transport fields it must carry:
//!
//! ```toml
//! [system]
//! name = "Dora"
//!
//! [[devices]]
//! name = "Victron MPPT 100/50"
//! brand = "victron"
//! mac_address = "C0:3B:98:12:34:56"
//! encryption_key = "0df4d0395b7d1a876c0c33ecb9e70dcd"
//!
//! [[devices]]
//! name = "Renogy DCC50S"
//! brand = "renogy"
//! ip_address = "192.168.1.40"
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::brand::Brand;
use crate::topic::slugify;

/// Default Modbus-TCP port
pub const DEFAULT_MODBUS_PORT: u16 = 502;

/// Default Modbus unit identifier
pub const DEFAULT_UNIT_ID: u8 = 1;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Unsupported device '{device}': unknown brand '{brand}'")]
    UnsupportedDevice { device: String, brand: String },
    #[error("Device '{device}': missing required field '{field}'")]
    MissingField { device: String, field: &'static str },
    #[error("Device '{device}': field '{field}' is not valid for brand '{brand}'")]
    UnexpectedField {
        device: String,
        field: &'static str,
        brand: Brand,
    },
    #[error("Device '{device}': invalid {field}: {reason}")]
    InvalidField {
        device: String,
        field: &'static str,
        reason: String,
    },
    #[error("Duplicate device name or topic slug: '{0}'")]
    DuplicateDevice(String),
}

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VanConfig {
    pub system: SystemConfig,
    pub drivers: DriverTuning,
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemConfig {
    /// System name, first segment of every topic
    pub name: String,
    /// Seconds between acquisition cycles
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

impl SystemConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

fn default_poll_interval() -> u64 {
    10
}

/// Timeouts and retry policy shared by all drivers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverTuning {
    /// Network connect/probe timeout
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Network request round-trip timeout
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,
    /// Longest wait for a fresh radio advertisement
    #[serde(default = "default_frame_timeout")]
    pub frame_timeout_ms: u64,
    /// Consecutive failed reads before a driver is marked failed
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// First reconnect backoff after a failed retry
    #[serde(default = "default_retry_initial")]
    pub retry_initial_secs: u64,
    /// Backoff ceiling
    #[serde(default = "default_retry_max")]
    pub retry_max_secs: u64,
}

impl Default for DriverTuning {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout(),
            read_timeout_ms: default_read_timeout(),
            frame_timeout_ms: default_frame_timeout(),
            failure_threshold: default_failure_threshold(),
            retry_initial_secs: default_retry_initial(),
            retry_max_secs: default_retry_max(),
        }
    }
}

impl DriverTuning {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }

    pub fn retry_initial(&self) -> Duration {
        Duration::from_secs(self.retry_initial_secs)
    }

    pub fn retry_max(&self) -> Duration {
        Duration::from_secs(self.retry_max_secs)
    }
}

fn default_connect_timeout() -> u64 {
    3000
}

fn default_read_timeout() -> u64 {
    2000
}

fn default_frame_timeout() -> u64 {
    5000
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_retry_initial() -> u64 {
    5
}

fn default_retry_max() -> u64 {
    300
}

/// One physical device, discriminated by brand
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "brand", rename_all = "lowercase")]
pub enum DeviceConfig {
    Victron(RadioDeviceConfig),
    Renogy(NetworkDeviceConfig),
}

impl DeviceConfig {
    pub fn name(&self) -> &str {
        match self {
            DeviceConfig::Victron(c) => &c.name,
            DeviceConfig::Renogy(c) => &c.name,
        }
    }

    pub fn brand(&self) -> Brand {
        match self {
            DeviceConfig::Victron(_) => Brand::Victron,
            DeviceConfig::Renogy(_) => Brand::Renogy,
        }
    }
}

/// Device reached through encrypted BLE advertisements
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RadioDeviceConfig {
    pub name: String,
    pub mac_address: String,
    pub encryption_key: String,
}

/// Device reached over the local network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkDeviceConfig {
    pub name: String,
    pub ip_address: String,
    #[serde(default = "default_modbus_port")]
    pub port: u16,
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
}

fn default_modbus_port() -> u16 {
    DEFAULT_MODBUS_PORT
}

fn default_unit_id() -> u8 {
    DEFAULT_UNIT_ID
}

/// File shape before device entries are checked against their brand
#[derive(Debug, Deserialize)]
struct RawConfig {
    system: SystemConfig,
    #[serde(default)]
    drivers: DriverTuning,
    #[serde(default)]
    devices: Vec<RawDeviceConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct RawDeviceConfig {
    name: Option<String>,
    brand: Option<String>,
    mac_address: Option<String>,
    encryption_key: Option<String>,
    ip_address: Option<String>,
    port: Option<u16>,
    unit_id: Option<u8>,
}

impl RawDeviceConfig {
    fn into_device(self, index: usize) -> Result<DeviceConfig, ConfigError> {
        let name = match self.name {
            Some(name) if !name.trim().is_empty() => name,
            _ => {
                return Err(ConfigError::MissingField {
                    device: format!("devices[{index}]"),
                    field: "name",
                })
            }
        };
        let brand_tag = self.brand.ok_or_else(|| ConfigError::MissingField {
            device: name.clone(),
            field: "brand",
        })?;
        let brand: Brand = brand_tag
            .parse()
            .map_err(|_| ConfigError::UnsupportedDevice {
                device: name.clone(),
                brand: brand_tag.clone(),
            })?;

        let require = |value: Option<String>, field: &'static str| {
            value.ok_or_else(|| ConfigError::MissingField {
                device: name.clone(),
                field,
            })
        };
        let reject = |present: bool, field: &'static str| {
            if present {
                Err(ConfigError::UnexpectedField {
                    device: name.clone(),
                    field,
                    brand,
                })
            } else {
                Ok(())
            }
        };

        match brand {
            Brand::Victron => {
                reject(self.ip_address.is_some(), "ip_address")?;
                reject(self.port.is_some(), "port")?;
                reject(self.unit_id.is_some(), "unit_id")?;
                Ok(DeviceConfig::Victron(RadioDeviceConfig {
                    mac_address: require(self.mac_address, "mac_address")?,
                    encryption_key: require(self.encryption_key, "encryption_key")?,
                    name,
                }))
            }
            Brand::Renogy => {
                reject(self.mac_address.is_some(), "mac_address")?;
                reject(self.encryption_key.is_some(), "encryption_key")?;
                Ok(DeviceConfig::Renogy(NetworkDeviceConfig {
                    ip_address: require(self.ip_address, "ip_address")?,
                    port: self.port.unwrap_or(DEFAULT_MODBUS_PORT),
                    unit_id: self.unit_id.unwrap_or(DEFAULT_UNIT_ID),
                    name,
                }))
            }
        }
    }
}

impl VanConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(content)?;

        let devices = raw
            .devices
            .into_iter()
            .enumerate()
            .map(|(index, device)| device.into_device(index))
            .collect::<Result<Vec<_>, _>>()?;

        let config = Self {
            system: raw.system,
            drivers: raw.drivers,
            devices,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check cross-device invariants
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.system.name.trim().is_empty() {
            return Err(ConfigError::MissingField {
                device: "system".to_string(),
                field: "name",
            });
        }
        if self.system.poll_interval_secs == 0 {
            return Err(ConfigError::InvalidField {
                device: "system".to_string(),
                field: "poll_interval_secs",
                reason: "must be at least 1".to_string(),
            });
        }
        for (field, value) in [
            ("connect_timeout_ms", self.drivers.connect_timeout_ms),
            ("read_timeout_ms", self.drivers.read_timeout_ms),
            ("frame_timeout_ms", self.drivers.frame_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidField {
                    device: "drivers".to_string(),
                    field,
                    reason: "must be at least 1".to_string(),
                });
            }
        }
        if self.drivers.failure_threshold == 0 {
            return Err(ConfigError::InvalidField {
                device: "drivers".to_string(),
                field: "failure_threshold",
                reason: "must be at least 1".to_string(),
            });
        }

        // Two devices publishing on one topic would be indistinguishable
        let mut slugs: HashMap<String, &str> = HashMap::new();
        for device in &self.devices {
            if let Some(previous) = slugs.insert(slugify(device.name()), device.name()) {
                return Err(ConfigError::DuplicateDevice(format!(
                    "{} / {}",
                    previous,
                    device.name()
                )));
            }
        }
        Ok(())
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<VanConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }
    let content = std::fs::read_to_string(path)?;
    let config = VanConfig::from_toml_str(&content)?;
    info!(
        path = %path.display(),
        system = %config.system.name,
        devices = config.devices.len(),
        "Loaded configuration"
    );
    Ok(config)
}
