//! Normalized telemetry samples and the payload published for them

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::address::MacAddress;

/// Operating state of a charger, normalized across vendors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperatingState {
    #[default]
    Unknown,
    Charging,
    Idle,
    Fault,
}

impl std::fmt::Display for OperatingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OperatingState::Unknown => "unknown",
            OperatingState::Charging => "charging",
            OperatingState::Idle => "idle",
            OperatingState::Fault => "fault",
        };
        f.write_str(s)
    }
}

/// Transport identity of a device, serialized as `mac_address` or `ip_address`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportAddress {
    #[serde(rename = "mac_address")]
    Radio(MacAddress),
    #[serde(rename = "ip_address")]
    Network(String),
}

impl std::fmt::Display for TransportAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportAddress::Radio(mac) => write!(f, "{mac}"),
            TransportAddress::Network(addr) => f.write_str(addr),
        }
    }
}

/// One reading taken from a device
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetrySample {
    pub device: String,
    pub address: TransportAddress,
    /// Volts
    pub voltage: f64,
    /// Amps, positive while charging
    pub current: f64,
    /// Watts
    pub power: f64,
    pub state: OperatingState,
    pub connected: bool,
    pub timestamp: DateTime<Utc>,
}

impl TelemetrySample {
    /// Create a sample stamped with the current time
    pub fn new(
        device: impl Into<String>,
        address: TransportAddress,
        voltage: f64,
        current: f64,
        power: f64,
        state: OperatingState,
    ) -> Self {
        Self {
            device: device.into(),
            address,
            voltage,
            current,
            power,
            state,
            connected: true,
            timestamp: Utc::now(),
        }
    }
}

/// Record published on a device's status topic every cycle
///
/// Healthy payloads carry numeric readings. Degraded payloads carry
/// `connected: false`, null readings, and an `error` string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusPayload {
    pub device: String,
    #[serde(flatten)]
    pub address: TransportAddress,
    pub voltage: Option<f64>,
    pub current: Option<f64>,
    pub power: Option<f64>,
    pub state: OperatingState,
    pub connected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl StatusPayload {
    pub fn from_sample(sample: &TelemetrySample) -> Self {
        Self {
            device: sample.device.clone(),
            address: sample.address.clone(),
            voltage: Some(sample.voltage),
            current: Some(sample.current),
            power: Some(sample.power),
            state: sample.state,
            connected: sample.connected,
            error: None,
            timestamp: sample.timestamp,
        }
    }

    /// Heartbeat for a device that could not be read this cycle
    pub fn degraded(
        device: impl Into<String>,
        address: TransportAddress,
        error: impl std::fmt::Display,
    ) -> Self {
        Self {
            device: device.into(),
            address,
            voltage: None,
            current: None,
            power: None,
            state: OperatingState::Unknown,
            connected: false,
            error: Some(error.to_string()),
            timestamp: Utc::now(),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.error.is_some()
    }

    /// Serialize to the JSON bytes placed on the bus
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}
