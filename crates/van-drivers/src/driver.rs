//! Driver contract and the connection state machine shared by all drivers
//!
//! ```text
//! Disconnected --connect ok--> Connected --disconnect--> Disconnected
//! Disconnected --connect err--> Failed --connect--> Connected | Failed
//! Connected --N consecutive link failures--> Failed
//! ```
//!
//! `Failed` is never terminal; the manager keeps retrying it.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info_span, warn, Span};
use van_bus::BusGateway;
use van_core::{status_topic, StatusPayload, TelemetrySample, TransportAddress};

use crate::error::{ConnectError, PublishError, ReadError};

/// Connection state of a driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl std::fmt::Display for DriverState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DriverState::Disconnected => "disconnected",
            DriverState::Connecting => "connecting",
            DriverState::Connected => "connected",
            DriverState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// What a `publish_status` call put on the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// A full reading was published
    Healthy,
    /// A degraded heartbeat was published, carrying this error
    Degraded(String),
}

/// Identity, state, and bus handle common to every driver
pub struct DriverCore {
    name: String,
    system: String,
    topic: String,
    address: TransportAddress,
    state: DriverState,
    consecutive_failures: u32,
    failure_threshold: u32,
    bus: Arc<dyn BusGateway>,
    span: Span,
}

impl DriverCore {
    pub fn new(
        system: &str,
        name: &str,
        address: TransportAddress,
        bus: Arc<dyn BusGateway>,
        failure_threshold: u32,
    ) -> Self {
        let span = info_span!("driver", device = %name, address = %address);
        Self {
            name: name.to_string(),
            system: system.to_string(),
            topic: status_topic(system, name),
            address,
            state: DriverState::Disconnected,
            consecutive_failures: 0,
            failure_threshold: failure_threshold.max(1),
            bus,
            span,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn system(&self) -> &str {
        &self.system
    }

    /// Status topic this driver publishes on
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn address(&self) -> &TransportAddress {
        &self.address
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == DriverState::Connected
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    /// Span that driver operations should run inside
    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn set_state(&mut self, state: DriverState) {
        if self.state != state {
            debug!(device = %self.name, from = %self.state, to = %state, "Driver state change");
            self.state = state;
        }
        if state != DriverState::Connected {
            self.consecutive_failures = 0;
        }
    }

    /// Fail fast when the link is not up, before any I/O
    pub fn ensure_connected(&self) -> Result<(), ReadError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(ReadError::NotConnected)
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    /// Count a failed read; returns true when this failure moved the
    /// driver to `Failed`
    pub fn record_failure(&mut self, error: &ReadError) -> bool {
        if !error.is_link_failure() || !self.is_connected() {
            return false;
        }
        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.failure_threshold {
            warn!(
                device = %self.name,
                failures = self.consecutive_failures,
                error = %error,
                "Consecutive read failures reached threshold, marking driver failed"
            );
            self.set_state(DriverState::Failed);
            true
        } else {
            debug!(
                device = %self.name,
                failures = self.consecutive_failures,
                threshold = self.failure_threshold,
                error = %error,
                "Read failed, link kept"
            );
            false
        }
    }

    /// Serialize a payload and hand it to the bus
    pub async fn publish(&self, payload: &StatusPayload) -> Result<(), PublishError> {
        let bytes = payload.to_json()?;
        self.bus.publish(&self.topic, bytes).await?;
        Ok(())
    }
}

/// Uniform lifecycle implemented by every transport
#[async_trait]
pub trait DeviceDriver: Send + Sync {
    fn core(&self) -> &DriverCore;

    fn core_mut(&mut self) -> &mut DriverCore;

    /// Establish the transport link
    ///
    /// Moves to `Connected` on success and to `Failed` on error.
    async fn connect(&mut self) -> Result<(), ConnectError>;

    /// Release the transport; always ends in `Disconnected`
    async fn disconnect(&mut self);

    /// Take one reading; `ReadError::NotConnected` without I/O unless connected
    async fn read_data(&mut self) -> Result<TelemetrySample, ReadError>;

    /// Read once and publish the result, degraded if the read failed
    async fn publish_status(&mut self) -> Result<PublishOutcome, PublishError> {
        let result = self.read_data().await;
        let core = self.core();

        let (payload, outcome) = match result {
            Ok(sample) => (StatusPayload::from_sample(&sample), PublishOutcome::Healthy),
            Err(e) => {
                debug!(device = %core.name(), error = %e, "Publishing degraded status");
                (
                    StatusPayload::degraded(core.name(), core.address().clone(), &e),
                    PublishOutcome::Degraded(e.to_string()),
                )
            }
        };

        core.publish(&payload).await?;
        Ok(outcome)
    }

    fn name(&self) -> &str {
        self.core().name()
    }

    fn state(&self) -> DriverState {
        self.core().state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use van_bus::MemoryBus;

    fn core(threshold: u32) -> (DriverCore, Arc<MemoryBus>) {
        let bus = Arc::new(MemoryBus::new());
        let core = DriverCore::new(
            "Dora",
            "Renogy DCC50S",
            TransportAddress::Network("10.0.0.2".to_string()),
            bus.clone(),
            threshold,
        );
        (core, bus)
    }

    #[test]
    fn test_core_identity() {
        let (core, _) = core(3);
        assert_eq!(core.topic(), "Dora/devices/renogy_dcc50s/status");
        assert_eq!(core.state(), DriverState::Disconnected);
        assert_eq!(core.failure_threshold(), 3);
        assert!(matches!(core.ensure_connected(), Err(ReadError::NotConnected)));
    }

    #[test]
    fn test_failures_escalate_at_threshold() {
        let (mut core, _) = core(3);
        core.set_state(DriverState::Connected);
        let timeout = ReadError::Timeout(Duration::from_millis(10));

        assert!(!core.record_failure(&timeout));
        assert!(!core.record_failure(&timeout));
        assert_eq!(core.state(), DriverState::Connected);
        assert!(core.record_failure(&timeout));
        assert_eq!(core.state(), DriverState::Failed);
        assert_eq!(core.consecutive_failures(), 0);
    }

    #[test]
    fn test_success_resets_counter() {
        let (mut core, _) = core(2);
        core.set_state(DriverState::Connected);
        let lost = ReadError::ConnectionLost("reset".to_string());

        assert!(!core.record_failure(&lost));
        core.record_success();
        assert!(!core.record_failure(&lost));
        assert_eq!(core.state(), DriverState::Connected);
    }

    #[test]
    fn test_protocol_errors_do_not_count() {
        let (mut core, _) = core(1);
        core.set_state(DriverState::Connected);
        let bad = ReadError::Protocol(crate::error::ProtocolError::KeyMismatch);
        assert!(!core.record_failure(&bad));
        assert_eq!(core.state(), DriverState::Connected);
    }

    #[test]
    fn test_zero_threshold_clamped() {
        let (core, _) = core(0);
        assert_eq!(core.failure_threshold(), 1);
    }

    #[tokio::test]
    async fn test_publish_writes_topic() {
        let (core, bus) = core(3);
        let payload = StatusPayload::degraded(
            core.name(),
            core.address().clone(),
            ReadError::NotConnected,
        );
        core.publish(&payload).await.unwrap();

        let json = bus.last_json("Dora/devices/renogy_dcc50s/status").unwrap();
        assert_eq!(json["connected"], false);
        assert_eq!(json["error"], "Device not connected");
    }
}
