//! Van Drivers - Device drivers and acquisition pipeline
//!
//! This crate turns configured devices into running drivers and keeps them
//! publishing:
//! - [`DeviceDriver`] contract and the shared connection state machine
//! - Victron BLE Instant Readout driver (AES-CTR decryption)
//! - Renogy Modbus-TCP network driver
//! - [`DriverFactory`] binding configuration to drivers
//! - [`DeviceManager`] supervising lifecycle and the publish cadence

pub mod driver;
pub mod error;
pub mod factory;
pub mod manager;
pub mod renogy;
pub mod victron;

pub use driver::{DeviceDriver, DriverCore, DriverState, PublishOutcome};
pub use error::{ConnectError, ProtocolError, PublishError, ReadError};
pub use factory::DriverFactory;
pub use manager::{CycleReport, DeviceManager, ManagerEvent, RetryPolicy};
pub use renogy::RenogyNetworkDriver;
pub use victron::{AdvertisementSource, RadioHub, VictronBleDriver};
