//! Van Core - Core types and configuration model for the van telemetry agent
//!
//! This crate provides the foundational types shared by every other crate:
//! - Brand registry mapping each vendor to its transport family
//! - Device configuration model and TOML loading
//! - Link-layer addresses and key material
//! - Telemetry samples, publish payloads, and topic naming

pub mod address;
pub mod brand;
pub mod config;
pub mod telemetry;
pub mod topic;

pub use address::{EncryptionKey, MacAddress, ParseAddressError};
pub use brand::{Brand, ParseBrandError, TransportKind};
pub use config::{
    load_config, ConfigError, DeviceConfig, DriverTuning, NetworkDeviceConfig,
    RadioDeviceConfig, SystemConfig, VanConfig,
};
pub use telemetry::{OperatingState, StatusPayload, TelemetrySample, TransportAddress};
pub use topic::{agent_status_topic, slugify, status_topic};
