//! BLE scanner feeding a [`RadioHub`] (enabled with the `ble` feature)

use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::Manager;
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use van_core::MacAddress;

use super::advertisement::VICTRON_COMPANY_ID;
use super::radio::{Advertisement, RadioHub};
use crate::error::ConnectError;

fn unavailable(e: impl std::fmt::Display) -> ConnectError {
    ConnectError::RadioUnavailable(e.to_string())
}

/// Start passive scanning on the first adapter and forward Victron frames
///
/// If no adapter is present the hub is marked unavailable, so radio
/// drivers fail to connect and are retried like any other failure.
pub async fn spawn_ble_scanner(hub: Arc<RadioHub>) -> Result<JoinHandle<()>, ConnectError> {
    let result = start_scan(hub.clone()).await;
    if let Err(e) = &result {
        warn!(error = %e, "BLE scanner unavailable");
        hub.set_available(false);
    }
    result
}

async fn start_scan(hub: Arc<RadioHub>) -> Result<JoinHandle<()>, ConnectError> {
    let manager = Manager::new().await.map_err(unavailable)?;
    let central = manager
        .adapters()
        .await
        .map_err(unavailable)?
        .into_iter()
        .next()
        .ok_or_else(|| unavailable("no bluetooth adapter found"))?;

    let mut events = central.events().await.map_err(unavailable)?;
    central
        .start_scan(ScanFilter::default())
        .await
        .map_err(unavailable)?;
    info!("BLE scan started");

    Ok(tokio::spawn(async move {
        while let Some(event) = events.next().await {
            let CentralEvent::ManufacturerDataAdvertisement {
                id,
                manufacturer_data,
            } = event
            else {
                continue;
            };
            let Some(data) = manufacturer_data.get(&VICTRON_COMPANY_ID) else {
                continue;
            };
            let peripheral = match central.peripheral(&id).await {
                Ok(p) => p,
                Err(e) => {
                    debug!(error = %e, "Advertisement from unknown peripheral");
                    continue;
                }
            };
            let address = MacAddress(peripheral.address().into_inner());
            hub.dispatch(Advertisement::new(address, data.clone()));
        }
        warn!("BLE event stream ended");
        hub.close();
    }))
}
