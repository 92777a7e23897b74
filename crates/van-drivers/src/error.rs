//! Driver error taxonomy
//!
//! Only configuration errors abort the agent. Everything here is
//! recoverable and ends up either as a degraded heartbeat or a retry.

use std::time::Duration;
use thiserror::Error;

/// Failure to establish a device link
#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("Could not resolve {address}: {source}")]
    Resolve {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("No address found for {0}")]
    NoAddress(String),
    #[error("Connection to {address} failed: {source}")]
    Unreachable {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Connection to {address} timed out after {after:?}")]
    Timeout { address: String, after: Duration },
    #[error("Radio unavailable: {0}")]
    RadioUnavailable(String),
    #[error("Driver panicked while connecting")]
    Panicked,
}

/// Malformed, undecryptable, or unexpected device data
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Payload too short: expected at least {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },
    #[error("Unexpected record prefix 0x{0:02x}")]
    UnexpectedPrefix(u8),
    #[error("Advertisement key check mismatch")]
    KeyMismatch,
    #[error("Unsupported readout type 0x{0:02x}")]
    UnsupportedRecord(u8),
    #[error("Field '{0}' not available")]
    InvalidField(&'static str),
    #[error("Modbus exception code 0x{0:02x}")]
    ModbusException(u8),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Failure to produce a telemetry sample
#[derive(Error, Debug)]
pub enum ReadError {
    #[error("Device not connected")]
    NotConnected,
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("No response within {0:?}")]
    Timeout(Duration),
    #[error("Connection lost: {0}")]
    ConnectionLost(String),
}

impl ReadError {
    /// Whether this failure counts toward the consecutive-failure threshold
    ///
    /// A bad frame proves the link is alive, so protocol errors never count.
    pub fn is_link_failure(&self) -> bool {
        matches!(self, ReadError::Timeout(_) | ReadError::ConnectionLost(_))
    }
}

impl From<ConnectError> for ReadError {
    fn from(e: ConnectError) -> Self {
        match e {
            ConnectError::Timeout { after, .. } => ReadError::Timeout(after),
            other => ReadError::ConnectionLost(other.to_string()),
        }
    }
}

/// Failure to put a status payload on the bus
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Payload encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("Bus error: {0}")]
    Bus(#[from] van_bus::BusError),
}
