//! Advertisement fan-out from one radio scanner to many drivers
//!
//! A single BLE scanner hears every device. Each driver subscribes to its
//! own address and gets a `watch` receiver that always holds the newest
//! frame, so a slow reader sees the latest state rather than a backlog.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{debug, trace};
use van_core::MacAddress;

use crate::error::ConnectError;

/// Manufacturer data received from one device
#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement {
    pub address: MacAddress,
    /// Manufacturer-specific payload, without the company id
    pub data: Vec<u8>,
    pub rssi: Option<i16>,
    pub received_at: DateTime<Utc>,
}

impl Advertisement {
    pub fn new(address: MacAddress, data: Vec<u8>) -> Self {
        Self {
            address,
            data,
            rssi: None,
            received_at: Utc::now(),
        }
    }
}

/// Receiver half handed to a driver; holds `None` until the first frame
pub type FrameReceiver = watch::Receiver<Option<Advertisement>>;

/// Source of advertisements, keyed by device address
pub trait AdvertisementSource: Send + Sync {
    /// Start receiving frames for `address`
    fn subscribe(&self, address: MacAddress) -> Result<FrameReceiver, ConnectError>;

    /// Called after a driver has dropped its receiver
    fn release(&self, _address: MacAddress) {}
}

/// In-process [`AdvertisementSource`] fed by a scanner task or by tests
#[derive(Debug)]
pub struct RadioHub {
    channels: Mutex<HashMap<MacAddress, watch::Sender<Option<Advertisement>>>>,
    available: AtomicBool,
}

impl Default for RadioHub {
    fn default() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }
}

impl RadioHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<MacAddress, watch::Sender<Option<Advertisement>>>> {
        self.channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Mark the radio adapter usable or not; subscriptions fail while unavailable
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Deliver a frame to the driver watching its address
    ///
    /// Returns false if nobody subscribed to that address.
    pub fn dispatch(&self, advertisement: Advertisement) -> bool {
        let channels = self.channels();
        match channels.get(&advertisement.address) {
            Some(tx) => {
                trace!(address = %advertisement.address, len = advertisement.data.len(), "Advertisement");
                tx.send_replace(Some(advertisement));
                true
            }
            None => false,
        }
    }

    /// Drop every channel; subscribed drivers observe a lost connection
    pub fn close(&self) {
        debug!("Closing radio hub");
        self.channels().clear();
    }

    pub fn subscribed(&self) -> Vec<MacAddress> {
        self.channels().keys().copied().collect()
    }
}

impl AdvertisementSource for RadioHub {
    fn subscribe(&self, address: MacAddress) -> Result<FrameReceiver, ConnectError> {
        if !self.is_available() {
            return Err(ConnectError::RadioUnavailable(
                "bluetooth adapter not available".to_string(),
            ));
        }
        let mut channels = self.channels();
        let tx = channels
            .entry(address)
            .or_insert_with(|| watch::channel(None).0);
        Ok(tx.subscribe())
    }

    fn release(&self, address: MacAddress) {
        let mut channels = self.channels();
        if channels
            .get(&address)
            .is_some_and(|tx| tx.receiver_count() == 0)
        {
            channels.remove(&address);
        }
    }
}
