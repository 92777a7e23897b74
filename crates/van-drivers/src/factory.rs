//! Binding device configuration to concrete drivers

use std::sync::Arc;
use tracing::debug;
use van_bus::BusGateway;
use van_core::{
    ConfigError, DeviceConfig, DriverTuning, EncryptionKey, MacAddress, NetworkDeviceConfig,
    RadioDeviceConfig,
};

use crate::driver::DeviceDriver;
use crate::renogy::RenogyNetworkDriver;
use crate::victron::{AdvertisementSource, VictronBleDriver};

/// Builds one driver per configured device
///
/// Holds the collaborators every driver of a kind shares: the radio
/// advertisement source and the timeout/threshold tuning.
#[derive(Clone)]
pub struct DriverFactory {
    radio: Arc<dyn AdvertisementSource>,
    tuning: DriverTuning,
}

impl DriverFactory {
    pub fn new(radio: Arc<dyn AdvertisementSource>, tuning: DriverTuning) -> Self {
        Self { radio, tuning }
    }

    pub fn tuning(&self) -> &DriverTuning {
        &self.tuning
    }

    /// Create the driver matching a device's brand
    ///
    /// Malformed transport fields are a hard error; nothing is skipped.
    pub fn create_driver(
        &self,
        system_name: &str,
        config: &DeviceConfig,
        bus: Arc<dyn BusGateway>,
    ) -> Result<Box<dyn DeviceDriver>, ConfigError> {
        debug!(device = %config.name(), brand = %config.brand(), "Creating driver");
        let driver: Box<dyn DeviceDriver> = match config {
            DeviceConfig::Victron(radio) => Box::new(self.victron_driver(system_name, radio, bus)?),
            DeviceConfig::Renogy(network) => {
                Box::new(self.renogy_driver(system_name, network, bus)?)
            }
        };
        Ok(driver)
    }

    pub fn victron_driver(
        &self,
        system_name: &str,
        config: &RadioDeviceConfig,
        bus: Arc<dyn BusGateway>,
    ) -> Result<VictronBleDriver, ConfigError> {
        let mac_address: MacAddress = parse_field(&config.name, "mac_address", &config.mac_address)?;
        let key: EncryptionKey =
            parse_field(&config.name, "encryption_key", &config.encryption_key)?;

        Ok(VictronBleDriver::new(
            system_name,
            &config.name,
            mac_address,
            key,
            self.radio.clone(),
            bus,
            self.tuning.frame_timeout(),
            self.tuning.failure_threshold,
        ))
    }

    pub fn renogy_driver(
        &self,
        system_name: &str,
        config: &NetworkDeviceConfig,
        bus: Arc<dyn BusGateway>,
    ) -> Result<RenogyNetworkDriver, ConfigError> {
        let host = config.ip_address.trim();
        if host.is_empty() {
            return Err(ConfigError::MissingField {
                device: config.name.clone(),
                field: "ip_address",
            });
        }
        if host.contains(char::is_whitespace) {
            return Err(ConfigError::InvalidField {
                device: config.name.clone(),
                field: "ip_address",
                reason: format!("'{}' is not a host name or address", config.ip_address),
            });
        }
        if config.port == 0 {
            return Err(ConfigError::InvalidField {
                device: config.name.clone(),
                field: "port",
                reason: "port must be non-zero".to_string(),
            });
        }

        Ok(RenogyNetworkDriver::new(
            system_name,
            &config.name,
            host,
            config.port,
            config.unit_id,
            bus,
            self.tuning.connect_timeout(),
            self.tuning.read_timeout(),
            self.tuning.failure_threshold,
        ))
    }
}

fn parse_field<T>(device: &str, field: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    if value.trim().is_empty() {
        return Err(ConfigError::MissingField {
            device: device.to_string(),
            field,
        });
    }
    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidField {
        device: device.to_string(),
        field,
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DriverState;
    use crate::victron::RadioHub;
    use van_bus::MemoryBus;

    fn factory() -> DriverFactory {
        DriverFactory::new(Arc::new(RadioHub::new()), DriverTuning::default())
    }

    fn victron(mac: &str, key: &str) -> DeviceConfig {
        DeviceConfig::Victron(RadioDeviceConfig {
            name: "Victron MPPT 100/50".to_string(),
            mac_address: mac.to_string(),
            encryption_key: key.to_string(),
        })
    }

    fn renogy(ip: &str, port: u16) -> DeviceConfig {
        DeviceConfig::Renogy(NetworkDeviceConfig {
            name: "Renogy DCC50S".to_string(),
            ip_address: ip.to_string(),
            port,
            unit_id: 1,
        })
    }

    #[test]
    fn test_victron_config_builds_radio_driver() {
        let bus = Arc::new(MemoryBus::new());
        let driver = factory()
            .create_driver(
                "Dora",
                &victron("C0:3B:98:12:34:56", "0df4d0395b7d1a876c0c33ecb9e70dcd"),
                bus,
            )
            .unwrap();
        assert_eq!(driver.name(), "Victron MPPT 100/50");
        assert_eq!(driver.state(), DriverState::Disconnected);
        assert_eq!(driver.core().topic(), "Dora/devices/victron_mppt_100_50/status");
        assert_eq!(driver.core().address().to_string(), "C0:3B:98:12:34:56");
    }

    #[test]
    fn test_typed_victron_driver_keeps_key() {
        let bus = Arc::new(MemoryBus::new());
        let config = RadioDeviceConfig {
            name: "Orion".to_string(),
            mac_address: "c0-3b-98-00-00-01".to_string(),
            encryption_key: "0DF4D0395B7D1A876C0C33ECB9E70DCD".to_string(),
        };
        let driver = factory().victron_driver("Dora", &config, bus).unwrap();
        assert_eq!(driver.mac_address().to_string(), "C0:3B:98:00:00:01");
        assert_eq!(driver.encryption_key().check_byte(), 0x0d);
    }

    #[test]
    fn test_renogy_config_builds_network_driver() {
        let bus = Arc::new(MemoryBus::new());
        let config = NetworkDeviceConfig {
            name: "Renogy DCC50S".to_string(),
            ip_address: "192.168.1.40".to_string(),
            port: 8502,
            unit_id: 16,
        };
        let driver = factory().renogy_driver("Dora", &config, bus).unwrap();
        assert_eq!(driver.ip_address(), "192.168.1.40");
        assert_eq!(driver.port(), 8502);
        assert_eq!(driver.unit_id(), 16);
        assert_eq!(driver.core().topic(), "Dora/devices/renogy_dcc50s/status");
    }

    #[test]
    fn test_missing_fields_rejected() {
        let bus: Arc<dyn BusGateway> = Arc::new(MemoryBus::new());
        let f = factory();

        let err = f
            .create_driver("Dora", &victron("", "0df4d0395b7d1a876c0c33ecb9e70dcd"), bus.clone())
            .err()
            .unwrap();
        assert!(matches!(err, ConfigError::MissingField { field: "mac_address", .. }));

        let err = f
            .create_driver("Dora", &victron("C0:3B:98:12:34:56", " "), bus.clone())
            .err()
            .unwrap();
        assert!(matches!(err, ConfigError::MissingField { field: "encryption_key", .. }));

        let err = f.create_driver("Dora", &renogy("", 502), bus).err().unwrap();
        assert!(matches!(err, ConfigError::MissingField { field: "ip_address", .. }));
    }

    #[test]
    fn test_invalid_fields_rejected() {
        let bus: Arc<dyn BusGateway> = Arc::new(MemoryBus::new());
        let f = factory();

        let err = f
            .create_driver("Dora", &victron("C0:3B:98", "0df4d0395b7d1a876c0c33ecb9e70dcd"), bus.clone())
            .err()
            .unwrap();
        assert!(matches!(err, ConfigError::InvalidField { field: "mac_address", .. }));

        let err = f
            .create_driver("Dora", &victron("C0:3B:98:12:34:56", "abcd"), bus.clone())
            .err()
            .unwrap();
        assert!(matches!(err, ConfigError::InvalidField { field: "encryption_key", .. }));

        let err = f.create_driver("Dora", &renogy("10.0.0 .2", 502), bus.clone()).err().unwrap();
        assert!(matches!(err, ConfigError::InvalidField { field: "ip_address", .. }));

        let err = f.create_driver("Dora", &renogy("10.0.0.2", 0), bus).err().unwrap();
        assert!(matches!(err, ConfigError::InvalidField { field: "port", .. }));
    }
}
