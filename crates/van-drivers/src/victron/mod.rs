//! Victron driver over BLE Instant Readout advertisements
//!
//! The device never accepts a connection. "Connected" means the driver is
//! subscribed to the radio for its address; each read waits for a fresh
//! advertisement and decrypts it with the per-device key.

pub mod advertisement;
#[cfg(feature = "ble")]
pub mod ble;
pub mod radio;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use van_bus::BusGateway;
use van_core::{EncryptionKey, MacAddress, TelemetrySample, TransportAddress};

use crate::driver::{DeviceDriver, DriverCore, DriverState};
use crate::error::{ConnectError, ReadError};

pub use radio::{Advertisement, AdvertisementSource, FrameReceiver, RadioHub};

/// Driver for a Victron charger that broadcasts encrypted readings
pub struct VictronBleDriver {
    core: DriverCore,
    mac_address: MacAddress,
    key: EncryptionKey,
    radio: Arc<dyn AdvertisementSource>,
    frames: Option<FrameReceiver>,
    frame_timeout: Duration,
}

impl VictronBleDriver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        system: &str,
        name: &str,
        mac_address: MacAddress,
        key: EncryptionKey,
        radio: Arc<dyn AdvertisementSource>,
        bus: Arc<dyn BusGateway>,
        frame_timeout: Duration,
        failure_threshold: u32,
    ) -> Self {
        Self {
            core: DriverCore::new(
                system,
                name,
                TransportAddress::Radio(mac_address),
                bus,
                failure_threshold,
            ),
            mac_address,
            key,
            radio,
            frames: None,
            frame_timeout,
        }
    }

    pub fn mac_address(&self) -> MacAddress {
        self.mac_address
    }

    pub fn encryption_key(&self) -> &EncryptionKey {
        &self.key
    }

    /// Wait for an advertisement this driver has not decoded yet
    async fn next_frame(&mut self) -> Result<Advertisement, ReadError> {
        let Some(rx) = self.frames.as_mut() else {
            return Err(ReadError::NotConnected);
        };

        if rx.has_changed().unwrap_or(false) {
            let latest = rx.borrow_and_update().clone();
            if let Some(frame) = latest {
                return Ok(frame);
            }
        }

        match timeout(self.frame_timeout, rx.changed()).await {
            Ok(Ok(())) => {
                let latest = rx.borrow_and_update().clone();
                latest.ok_or_else(|| ReadError::ConnectionLost("empty advertisement".to_string()))
            }
            Ok(Err(_)) => Err(ReadError::ConnectionLost("radio scanner stopped".to_string())),
            Err(_) => Err(ReadError::Timeout(self.frame_timeout)),
        }
    }

    fn drop_subscription(&mut self) {
        if let Some(rx) = self.frames.take() {
            drop(rx);
            self.radio.release(self.mac_address);
        }
    }
}

#[async_trait]
impl DeviceDriver for VictronBleDriver {
    fn core(&self) -> &DriverCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut DriverCore {
        &mut self.core
    }

    async fn connect(&mut self) -> Result<(), ConnectError> {
        self.drop_subscription();
        self.core.set_state(DriverState::Connecting);

        match self.radio.subscribe(self.mac_address) {
            Ok(rx) => {
                self.frames = Some(rx);
                self.core.set_state(DriverState::Connected);
                self.core.record_success();
                info!(device = %self.core.name(), mac = %self.mac_address, "Listening for advertisements");
                Ok(())
            }
            Err(e) => {
                warn!(device = %self.core.name(), error = %e, "Radio subscription failed");
                self.core.set_state(DriverState::Failed);
                Err(e)
            }
        }
    }

    async fn disconnect(&mut self) {
        self.drop_subscription();
        self.core.set_state(DriverState::Disconnected);
    }

    async fn read_data(&mut self) -> Result<TelemetrySample, ReadError> {
        self.core.ensure_connected()?;

        let frame = match self.next_frame().await {
            Ok(frame) => frame,
            Err(e) => {
                if self.core.record_failure(&e) {
                    self.drop_subscription();
                }
                return Err(e);
            }
        };

        let readout = advertisement::decode(&frame.data, &self.key)?;
        self.core.record_success();
        debug!(
            device = %self.core.name(),
            voltage = readout.voltage(),
            current = readout.current(),
            rssi = ?frame.rssi,
            "Decoded advertisement"
        );

        let mut sample = TelemetrySample::new(
            self.core.name(),
            TransportAddress::Radio(self.mac_address),
            readout.voltage(),
            readout.current(),
            readout.power(),
            readout.state(),
        );
        sample.timestamp = frame.received_at;
        Ok(sample)
    }
}
