//! Renogy driver polling a charge controller over Modbus-TCP
//!
//! A single lost response does not fail the device. Link failures are
//! counted and only the configured number of consecutive failures moves
//! the driver to `Failed`.

pub mod modbus;
pub mod registers;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use van_bus::BusGateway;
use van_core::{TelemetrySample, TransportAddress};

use crate::driver::{DeviceDriver, DriverCore, DriverState};
use crate::error::{ConnectError, ProtocolError, ReadError};

pub use modbus::{ModbusTcpClient, DEFAULT_PORT};
pub use registers::ControllerReading;

/// Driver for a Renogy controller behind a Modbus-TCP gateway
pub struct RenogyNetworkDriver {
    core: DriverCore,
    host: String,
    port: u16,
    unit_id: u8,
    connect_timeout: Duration,
    read_timeout: Duration,
    client: Option<ModbusTcpClient>,
}

impl RenogyNetworkDriver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        system: &str,
        name: &str,
        host: &str,
        port: u16,
        unit_id: u8,
        bus: Arc<dyn BusGateway>,
        connect_timeout: Duration,
        read_timeout: Duration,
        failure_threshold: u32,
    ) -> Self {
        Self {
            core: DriverCore::new(
                system,
                name,
                TransportAddress::Network(host.to_string()),
                bus,
                failure_threshold,
            ),
            host: host.to_string(),
            port,
            unit_id,
            connect_timeout,
            read_timeout,
            client: None,
        }
    }

    pub fn ip_address(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn unit_id(&self) -> u8 {
        self.unit_id
    }

    async fn open(&self, limit: Duration) -> Result<ModbusTcpClient, ConnectError> {
        ModbusTcpClient::connect(&self.host, self.port, self.unit_id, limit, self.read_timeout)
            .await
    }

    async fn poll(&mut self) -> Result<ControllerReading, ReadError> {
        if self.client.is_none() {
            debug!(device = %self.core.name(), "Reopening Modbus session");
            self.client = Some(self.open(self.read_timeout).await?);
        }
        let Some(client) = self.client.as_mut() else {
            return Err(ReadError::NotConnected);
        };

        let registers = client
            .read_holding_registers(registers::BLOCK_START, registers::BLOCK_LEN)
            .await?;
        Ok(ControllerReading::from_registers(&registers)?)
    }
}

#[async_trait]
impl DeviceDriver for RenogyNetworkDriver {
    fn core(&self) -> &DriverCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut DriverCore {
        &mut self.core
    }

    async fn connect(&mut self) -> Result<(), ConnectError> {
        self.client = None;
        self.core.set_state(DriverState::Connecting);

        match self.open(self.connect_timeout).await {
            Ok(client) => {
                info!(device = %self.core.name(), peer = %client.peer(), "Connected");
                self.client = Some(client);
                self.core.set_state(DriverState::Connected);
                self.core.record_success();
                Ok(())
            }
            Err(e) => {
                warn!(device = %self.core.name(), error = %e, "Connect failed");
                self.core.set_state(DriverState::Failed);
                Err(e)
            }
        }
    }

    async fn disconnect(&mut self) {
        self.client = None;
        self.core.set_state(DriverState::Disconnected);
    }

    async fn read_data(&mut self) -> Result<TelemetrySample, ReadError> {
        self.core.ensure_connected()?;

        let reading = match self.poll().await {
            Ok(reading) => reading,
            Err(e) => {
                // Response framing can no longer be trusted after any error
                // other than a well-formed exception reply
                if !matches!(
                    e,
                    ReadError::Protocol(ProtocolError::ModbusException(_))
                ) {
                    self.client = None;
                }
                self.core.record_failure(&e);
                return Err(e);
            }
        };

        self.core.record_success();
        Ok(TelemetrySample::new(
            self.core.name(),
            TransportAddress::Network(self.host.clone()),
            reading.battery_voltage,
            reading.charging_current,
            reading.charging_power,
            reading.state(),
        ))
    }
}
