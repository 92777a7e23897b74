//! Device manager: owns every driver of one system and runs the
//! acquisition cycle
//!
//! Each cycle polls all drivers concurrently. A driver that is not
//! connected gets a reconnect attempt when its backoff allows, and every
//! driver publishes a heartbeat (healthy or degraded) whatever happened.
//! One driver's error or panic never affects the others.

use futures_util::future::join_all;
use futures_util::FutureExt;
use serde::Serialize;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn, Instrument};
use van_bus::BusGateway;
use van_core::{ConfigError, DriverTuning, StatusPayload, VanConfig};

use crate::driver::{DeviceDriver, DriverState, PublishOutcome};
use crate::error::ConnectError;
use crate::factory::DriverFactory;

/// Reconnect schedule for drivers that failed to connect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    pub fn from_tuning(tuning: &DriverTuning) -> Self {
        Self {
            initial: tuning.retry_initial(),
            max: tuning.retry_max(),
        }
    }

    /// Retry on every cycle
    pub fn immediate() -> Self {
        Self {
            initial: Duration::ZERO,
            max: Duration::ZERO,
        }
    }

    /// Wait before the next attempt after `failures` consecutive failures
    pub fn delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32 << (failures - 1).min(16);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_tuning(&DriverTuning::default())
    }
}

#[derive(Debug, Default)]
struct Backoff {
    failures: u32,
    next_attempt: Option<Instant>,
}

impl Backoff {
    fn due(&self, now: Instant) -> bool {
        match self.next_attempt {
            Some(at) => now >= at,
            None => true,
        }
    }

    fn failed(&mut self, policy: &RetryPolicy, now: Instant) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let wait = policy.delay(self.failures);
        self.next_attempt = Some(now + wait);
        wait
    }

    fn reset(&mut self) {
        self.failures = 0;
        self.next_attempt = None;
    }
}

struct DriverSlot {
    driver: Box<dyn DeviceDriver>,
    /// Disconnected on request; skipped by cycles until released
    held: bool,
    backoff: Backoff,
}

/// Lifecycle notifications for anyone watching the manager
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ManagerEvent {
    Connected { device: String },
    ConnectFailed {
        device: String,
        error: String,
        retry_in_ms: u64,
    },
    Published { device: String },
    Degraded { device: String, error: String },
    PublishFailed { device: String, error: String },
    /// Read failures crossed the threshold and the driver went to `Failed`
    Escalated { device: String },
    Panicked { device: String },
    Stopped { device: String },
}

/// Summary of one acquisition cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub published: usize,
    pub degraded: usize,
    pub reconnects_attempted: usize,
    pub reconnects_succeeded: usize,
    pub publish_errors: usize,
    pub skipped: usize,
    pub panicked: usize,
}

impl CycleReport {
    fn absorb(&mut self, slot: SlotOutcome) {
        self.published += usize::from(slot.published);
        self.degraded += usize::from(slot.degraded);
        self.reconnects_attempted += usize::from(slot.reconnect_attempted);
        self.reconnects_succeeded += usize::from(slot.reconnected);
        self.publish_errors += usize::from(slot.publish_error);
        self.skipped += usize::from(slot.skipped);
        self.panicked += usize::from(slot.panicked);
    }
}

#[derive(Debug, Default)]
struct SlotOutcome {
    published: bool,
    degraded: bool,
    reconnect_attempted: bool,
    reconnected: bool,
    publish_error: bool,
    skipped: bool,
    panicked: bool,
}

fn emit(events: &broadcast::Sender<ManagerEvent>, event: ManagerEvent) {
    // No subscribers is fine
    let _ = events.send(event);
}

async fn connect_slot(
    slot: &mut DriverSlot,
    retry: &RetryPolicy,
    events: &broadcast::Sender<ManagerEvent>,
) -> Result<(), ConnectError> {
    let device = slot.driver.name().to_string();
    match slot.driver.connect().await {
        Ok(()) => {
            slot.backoff.reset();
            info!(device = %device, "Driver connected");
            emit(events, ManagerEvent::Connected { device });
            Ok(())
        }
        Err(e) => {
            let wait = slot.backoff.failed(retry, Instant::now());
            warn!(device = %device, error = %e, retry_in = ?wait, "Driver connect failed");
            emit(
                events,
                ManagerEvent::ConnectFailed {
                    device,
                    error: e.to_string(),
                    retry_in_ms: u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                },
            );
            Err(e)
        }
    }
}

/// `connect_slot` with a panicking driver contained and left `Failed`
async fn guarded_connect(
    slot: &mut DriverSlot,
    retry: &RetryPolicy,
    events: &broadcast::Sender<ManagerEvent>,
) -> Result<(), ConnectError> {
    let span = slot.driver.core().span().clone();
    let result = AssertUnwindSafe(connect_slot(slot, retry, events))
        .catch_unwind()
        .instrument(span)
        .await;

    match result {
        Ok(connected) => connected,
        Err(_) => {
            let device = slot.driver.name().to_string();
            error!(device = %device, "Driver panicked during connect");
            slot.driver.core_mut().set_state(DriverState::Failed);
            slot.backoff.failed(retry, Instant::now());
            emit(events, ManagerEvent::Panicked { device });
            Err(ConnectError::Panicked)
        }
    }
}

/// Disconnect and hold a driver; a panic still leaves it `Disconnected`
async fn guarded_disconnect(slot: &mut DriverSlot, events: &broadcast::Sender<ManagerEvent>) {
    slot.held = true;
    let span = slot.driver.core().span().clone();
    let result = AssertUnwindSafe(slot.driver.disconnect())
        .catch_unwind()
        .instrument(span)
        .await;

    let device = slot.driver.name().to_string();
    if result.is_err() {
        error!(device = %device, "Driver panicked during disconnect");
        slot.driver.core_mut().set_state(DriverState::Disconnected);
        emit(
            events,
            ManagerEvent::Panicked {
                device: device.clone(),
            },
        );
    }
    emit(events, ManagerEvent::Stopped { device });
}

async fn drive_slot(
    slot: &mut DriverSlot,
    retry: &RetryPolicy,
    events: &broadcast::Sender<ManagerEvent>,
) -> SlotOutcome {
    let mut outcome = SlotOutcome::default();
    let device = slot.driver.name().to_string();

    if slot.driver.state() != DriverState::Connected && slot.backoff.due(Instant::now()) {
        outcome.reconnect_attempted = true;
        outcome.reconnected = connect_slot(slot, retry, events).await.is_ok();
    }

    let was_connected = slot.driver.state() == DriverState::Connected;
    match slot.driver.publish_status().await {
        Ok(PublishOutcome::Healthy) => {
            outcome.published = true;
            emit(events, ManagerEvent::Published { device: device.clone() });
        }
        Ok(PublishOutcome::Degraded(error)) => {
            outcome.degraded = true;
            emit(events, ManagerEvent::Degraded { device: device.clone(), error });
        }
        Err(e) => {
            outcome.publish_error = true;
            warn!(device = %device, error = %e, "Status publish failed");
            emit(
                events,
                ManagerEvent::PublishFailed {
                    device: device.clone(),
                    error: e.to_string(),
                },
            );
        }
    }

    if was_connected && slot.driver.state() == DriverState::Failed {
        emit(events, ManagerEvent::Escalated { device });
    }
    outcome
}

async fn cycle_slot(
    slot: &mut DriverSlot,
    retry: &RetryPolicy,
    events: &broadcast::Sender<ManagerEvent>,
) -> SlotOutcome {
    if slot.held {
        return SlotOutcome {
            skipped: true,
            ..SlotOutcome::default()
        };
    }

    let span = slot.driver.core().span().clone();
    let result = AssertUnwindSafe(drive_slot(slot, retry, events))
        .catch_unwind()
        .instrument(span)
        .await;

    match result {
        Ok(outcome) => outcome,
        Err(_) => {
            let core = slot.driver.core();
            error!(device = %core.name(), "Driver panicked during cycle");
            emit(
                events,
                ManagerEvent::Panicked {
                    device: core.name().to_string(),
                },
            );
            let payload =
                StatusPayload::degraded(core.name(), core.address().clone(), "driver panicked");
            let published = core.publish(&payload).await;
            if let Err(e) = &published {
                warn!(device = %core.name(), error = %e, "Status publish failed");
            }
            SlotOutcome {
                panicked: true,
                degraded: published.is_ok(),
                publish_error: published.is_err(),
                ..SlotOutcome::default()
            }
        }
    }
}

/// Owns the drivers of one system for the life of the process
pub struct DeviceManager {
    system: String,
    slots: Vec<DriverSlot>,
    retry: RetryPolicy,
    events: broadcast::Sender<ManagerEvent>,
}

impl DeviceManager {
    /// Build every configured driver; the first bad device aborts startup
    pub fn initialize(
        config: &VanConfig,
        factory: &DriverFactory,
        bus: Arc<dyn BusGateway>,
    ) -> Result<Self, ConfigError> {
        let drivers = config
            .devices
            .iter()
            .map(|device| factory.create_driver(&config.system.name, device, bus.clone()))
            .collect::<Result<Vec<_>, _>>()?;

        info!(
            system = %config.system.name,
            devices = drivers.len(),
            "Device manager initialized"
        );
        Ok(Self::from_drivers(
            &config.system.name,
            drivers,
            RetryPolicy::from_tuning(&config.drivers),
        ))
    }

    /// Manage an already-built set of drivers
    pub fn from_drivers(system: &str, drivers: Vec<Box<dyn DeviceDriver>>, retry: RetryPolicy) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            system: system.to_string(),
            slots: drivers
                .into_iter()
                .map(|driver| DriverSlot {
                    driver,
                    held: false,
                    backoff: Backoff::default(),
                })
                .collect(),
            retry,
            events,
        }
    }

    pub fn system(&self) -> &str {
        &self.system
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Subscribe to lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.events.subscribe()
    }

    /// Name and state of every driver, in configuration order
    pub fn statuses(&self) -> Vec<(String, DriverState)> {
        self.slots
            .iter()
            .map(|slot| (slot.driver.name().to_string(), slot.driver.state()))
            .collect()
    }

    /// Connect every driver; returns how many connected
    ///
    /// A failed device is left in `Failed` and retried by later cycles.
    pub async fn start_all(&mut self) -> usize {
        let Self {
            ref mut slots,
            ref retry,
            ref events,
            ..
        } = *self;

        let attempts = slots.iter_mut().map(|slot| {
            slot.held = false;
            slot.backoff.reset();
            guarded_connect(slot, retry, events)
        });
        let connected = join_all(attempts)
            .await
            .into_iter()
            .filter(Result::is_ok)
            .count();

        info!(
            system = %self.system,
            connected,
            total = self.slots.len(),
            "Drivers started"
        );
        connected
    }

    /// Run one acquisition cycle over all drivers
    pub async fn run_cycle(&mut self) -> CycleReport {
        let Self {
            ref mut slots,
            ref retry,
            ref events,
            ..
        } = *self;

        let outcomes = join_all(slots.iter_mut().map(|slot| cycle_slot(slot, retry, events))).await;

        let mut report = CycleReport::default();
        for outcome in outcomes {
            report.absorb(outcome);
        }
        debug!(system = %self.system, ?report, "Cycle complete");
        report
    }

    /// Disconnect every driver and hold it until the next `start_all`
    pub async fn stop_all(&mut self) {
        let Self {
            ref mut slots,
            ref events,
            ..
        } = *self;

        join_all(
            slots
                .iter_mut()
                .map(|slot| guarded_disconnect(slot, events)),
        )
        .await;
        info!(system = %self.system, "Drivers stopped");
    }

    fn slot_mut(&mut self, name: &str) -> Option<&mut DriverSlot> {
        self.slots.iter_mut().find(|slot| slot.driver.name() == name)
    }

    /// Disconnect one driver and skip it until `connect_device`
    ///
    /// Returns false if no driver has that name.
    pub async fn disconnect_device(&mut self, name: &str) -> bool {
        let events = self.events.clone();
        let Some(slot) = self.slot_mut(name) else {
            return false;
        };
        guarded_disconnect(slot, &events).await;
        true
    }

    /// Release a held driver and connect it now
    ///
    /// `None` if no driver has that name.
    pub async fn connect_device(&mut self, name: &str) -> Option<Result<(), ConnectError>> {
        let retry = self.retry;
        let events = self.events.clone();
        let slot = self.slot_mut(name)?;
        slot.held = false;
        slot.backoff.reset();
        Some(guarded_connect(slot, &retry, &events).await)
    }

    /// Run cycles every `period` until `shutdown` resolves, then stop all
    /// drivers
    ///
    /// An in-flight cycle is abandoned as soon as shutdown is signalled.
    pub async fn run_until<F>(&mut self, period: Duration, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut ticker = interval(period.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(system = %self.system, period = ?period, "Acquisition loop started");
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    tokio::select! {
                        report = self.run_cycle() => {
                            if report.degraded + report.publish_errors + report.panicked > 0 {
                                debug!(?report, "Cycle finished with degraded devices");
                            }
                        }
                        _ = &mut shutdown => break,
                    }
                }
            }
        }

        info!(system = %self.system, "Shutdown requested");
        self.stop_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DriverCore;
    use crate::error::ReadError;
    use crate::victron::advertisement::{encrypt_record, readout, SolarChargerRecord};
    use crate::victron::{Advertisement, RadioHub};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use van_bus::MemoryBus;
    use van_core::{OperatingState, TelemetrySample, TransportAddress};

    enum Behavior {
        Healthy,
        RefuseConnect,
        PanicOnRead,
        PanicOnConnect,
        PanicOnDisconnect,
    }

    struct MockDriver {
        core: DriverCore,
        behavior: Behavior,
        connects: Arc<AtomicUsize>,
    }

    impl MockDriver {
        fn boxed(name: &str, behavior: Behavior, bus: Arc<MemoryBus>) -> (Box<dyn DeviceDriver>, Arc<AtomicUsize>) {
            let connects = Arc::new(AtomicUsize::new(0));
            let driver = Self {
                core: DriverCore::new(
                    "Dora",
                    name,
                    TransportAddress::Network("10.0.0.9".to_string()),
                    bus,
                    3,
                ),
                behavior,
                connects: connects.clone(),
            };
            (Box::new(driver), connects)
        }
    }

    #[async_trait]
    impl DeviceDriver for MockDriver {
        fn core(&self) -> &DriverCore {
            &self.core
        }

        fn core_mut(&mut self) -> &mut DriverCore {
            &mut self.core
        }

        async fn connect(&mut self) -> Result<(), ConnectError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                Behavior::RefuseConnect => {
                    self.core.set_state(DriverState::Failed);
                    Err(ConnectError::NoAddress("mock".to_string()))
                }
                Behavior::PanicOnConnect => panic!("mock connect panic"),
                _ => {
                    self.core.set_state(DriverState::Connected);
                    Ok(())
                }
            }
        }

        async fn disconnect(&mut self) {
            if let Behavior::PanicOnDisconnect = self.behavior {
                panic!("mock disconnect panic");
            }
            self.core.set_state(DriverState::Disconnected);
        }

        async fn read_data(&mut self) -> Result<TelemetrySample, ReadError> {
            self.core.ensure_connected()?;
            match self.behavior {
                Behavior::PanicOnRead => panic!("mock driver panic"),
                _ => Ok(TelemetrySample::new(
                    self.core.name(),
                    self.core.address().clone(),
                    12.8,
                    1.5,
                    19.2,
                    OperatingState::Charging,
                )),
            }
        }
    }

    fn topic(slug: &str) -> String {
        format!("Dora/devices/{slug}/status")
    }

    #[test]
    fn test_retry_delay_doubles_and_caps() {
        let policy = RetryPolicy {
            initial: Duration::from_secs(5),
            max: Duration::from_secs(30),
        };
        assert_eq!(policy.delay(0), Duration::ZERO);
        assert_eq!(policy.delay(1), Duration::from_secs(5));
        assert_eq!(policy.delay(2), Duration::from_secs(10));
        assert_eq!(policy.delay(3), Duration::from_secs(20));
        assert_eq!(policy.delay(4), Duration::from_secs(30));
        assert_eq!(policy.delay(60), Duration::from_secs(30));
    }

    #[test]
    fn test_backoff_due() {
        let policy = RetryPolicy {
            initial: Duration::from_secs(5),
            max: Duration::from_secs(60),
        };
        let start = Instant::now();
        let mut backoff = Backoff::default();
        assert!(backoff.due(start));

        assert_eq!(backoff.failed(&policy, start), Duration::from_secs(5));
        assert!(!backoff.due(start + Duration::from_secs(4)));
        assert!(backoff.due(start + Duration::from_secs(5)));

        backoff.reset();
        assert!(backoff.due(start));
    }

    #[tokio::test]
    async fn test_failure_isolation() {
        let bus = Arc::new(MemoryBus::new());
        let (healthy, _) = MockDriver::boxed("Shunt", Behavior::Healthy, bus.clone());
        let (refusing, _) = MockDriver::boxed("Fridge", Behavior::RefuseConnect, bus.clone());
        let (panicking, _) = MockDriver::boxed("Inverter", Behavior::PanicOnRead, bus.clone());

        let mut manager =
            DeviceManager::from_drivers("Dora", vec![refusing, panicking, healthy], RetryPolicy::immediate());
        assert_eq!(manager.start_all().await, 2);

        let report = manager.run_cycle().await;
        assert_eq!(report.published, 1);
        assert_eq!(report.panicked, 1);
        assert_eq!(report.degraded, 2);
        assert_eq!(report.reconnects_attempted, 1);

        assert_eq!(bus.last_json(&topic("shunt")).unwrap()["connected"], true);
        assert_eq!(bus.last_json(&topic("fridge")).unwrap()["connected"], false);
        let panicked = bus.last_json(&topic("inverter")).unwrap();
        assert_eq!(panicked["error"], "driver panicked");

        // The next cycle still runs everything
        let report = manager.run_cycle().await;
        assert_eq!(report.published, 1);
        assert_eq!(bus.published_to(&topic("shunt")).len(), 2);
    }

    #[tokio::test]
    async fn test_connect_panic_does_not_block_start() {
        let bus = Arc::new(MemoryBus::new());
        let (bad, _) = MockDriver::boxed("Inverter", Behavior::PanicOnConnect, bus.clone());
        let (good, _) = MockDriver::boxed("Shunt", Behavior::Healthy, bus.clone());
        let mut manager = DeviceManager::from_drivers("Dora", vec![bad, good], RetryPolicy::immediate());
        let mut events = manager.subscribe();

        assert_eq!(manager.start_all().await, 1);
        assert_eq!(
            manager.statuses(),
            vec![
                ("Inverter".to_string(), DriverState::Failed),
                ("Shunt".to_string(), DriverState::Connected),
            ]
        );

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(seen.contains(&ManagerEvent::Panicked {
            device: "Inverter".to_string()
        }));

        assert!(matches!(
            manager.connect_device("Inverter").await,
            Some(Err(ConnectError::Panicked))
        ));

        // Cycles keep running and report the panicking device as degraded
        let report = manager.run_cycle().await;
        assert_eq!(report.published, 1);
        assert_eq!(report.panicked, 1);
        assert_eq!(bus.last_json(&topic("inverter")).unwrap()["error"], "driver panicked");
    }

    #[tokio::test]
    async fn test_disconnect_panic_does_not_block_stop() {
        let bus = Arc::new(MemoryBus::new());
        let (bad, _) = MockDriver::boxed("Inverter", Behavior::PanicOnDisconnect, bus.clone());
        let (good, _) = MockDriver::boxed("Shunt", Behavior::Healthy, bus.clone());
        let mut manager = DeviceManager::from_drivers("Dora", vec![bad, good], RetryPolicy::immediate());
        assert_eq!(manager.start_all().await, 2);
        let mut events = manager.subscribe();

        manager.stop_all().await;
        assert_eq!(
            manager.statuses(),
            vec![
                ("Inverter".to_string(), DriverState::Disconnected),
                ("Shunt".to_string(), DriverState::Disconnected),
            ]
        );

        let mut stopped = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ManagerEvent::Stopped { device } = event {
                stopped.push(device);
            }
        }
        stopped.sort();
        assert_eq!(stopped, vec!["Inverter".to_string(), "Shunt".to_string()]);

        // Held drivers are skipped, single-device disconnect is guarded too
        assert_eq!(manager.run_cycle().await.skipped, 2);
        assert!(manager.disconnect_device("Inverter").await);
    }

    #[tokio::test]
    async fn test_backoff_limits_reconnects() {
        let bus = Arc::new(MemoryBus::new());
        let (refusing, connects) = MockDriver::boxed("Fridge", Behavior::RefuseConnect, bus.clone());
        let policy = RetryPolicy {
            initial: Duration::from_secs(60),
            max: Duration::from_secs(600),
        };
        let mut manager = DeviceManager::from_drivers("Dora", vec![refusing], policy);

        assert_eq!(manager.start_all().await, 0);
        let report = manager.run_cycle().await;
        assert_eq!(report.reconnects_attempted, 0);
        assert_eq!(report.degraded, 1);
        assert_eq!(connects.load(Ordering::SeqCst), 1);
        assert_eq!(manager.statuses(), vec![("Fridge".to_string(), DriverState::Failed)]);
    }

    #[tokio::test]
    async fn test_failed_driver_recovers_on_retry() {
        let bus = Arc::new(MemoryBus::new());
        let (healthy, connects) = MockDriver::boxed("Shunt", Behavior::Healthy, bus.clone());
        let mut manager = DeviceManager::from_drivers("Dora", vec![healthy], RetryPolicy::immediate());

        // Never started: the first cycle connects it
        let report = manager.run_cycle().await;
        assert_eq!(report.reconnects_attempted, 1);
        assert_eq!(report.reconnects_succeeded, 1);
        assert_eq!(report.published, 1);
        assert_eq!(connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_held_device_skipped() {
        let bus = Arc::new(MemoryBus::new());
        let (shunt, _) = MockDriver::boxed("Shunt", Behavior::Healthy, bus.clone());
        let (fridge, _) = MockDriver::boxed("Fridge", Behavior::Healthy, bus.clone());
        let mut manager = DeviceManager::from_drivers("Dora", vec![shunt, fridge], RetryPolicy::immediate());
        manager.start_all().await;

        assert!(manager.disconnect_device("Fridge").await);
        assert!(!manager.disconnect_device("Nope").await);

        let report = manager.run_cycle().await;
        assert_eq!(report.skipped, 1);
        assert_eq!(report.published, 1);
        assert!(bus.published_to(&topic("fridge")).is_empty());

        assert!(matches!(manager.connect_device("Fridge").await, Some(Ok(()))));
        assert!(manager.connect_device("Nope").await.is_none());
        let report = manager.run_cycle().await;
        assert_eq!(report.published, 2);
    }

    #[tokio::test]
    async fn test_stop_all_disconnects_and_holds() {
        let bus = Arc::new(MemoryBus::new());
        let (shunt, _) = MockDriver::boxed("Shunt", Behavior::Healthy, bus.clone());
        let mut manager = DeviceManager::from_drivers("Dora", vec![shunt], RetryPolicy::immediate());
        let mut events = manager.subscribe();

        manager.start_all().await;
        assert_eq!(events.recv().await.unwrap(), ManagerEvent::Connected { device: "Shunt".to_string() });

        manager.stop_all().await;
        assert_eq!(events.recv().await.unwrap(), ManagerEvent::Stopped { device: "Shunt".to_string() });
        assert_eq!(manager.statuses()[0].1, DriverState::Disconnected);

        let report = manager.run_cycle().await;
        assert_eq!(report.skipped, 1);
    }

    #[tokio::test]
    async fn test_publish_errors_counted() {
        let bus = Arc::new(MemoryBus::new());
        let (shunt, _) = MockDriver::boxed("Shunt", Behavior::Healthy, bus.clone());
        let mut manager = DeviceManager::from_drivers("Dora", vec![shunt], RetryPolicy::immediate());
        manager.start_all().await;

        bus.set_fail_publish(true);
        let report = manager.run_cycle().await;
        assert_eq!(report.publish_errors, 1);
        assert_eq!(manager.statuses()[0].1, DriverState::Connected);
    }

    #[tokio::test]
    async fn test_run_until_stops_drivers() {
        let bus = Arc::new(MemoryBus::new());
        let (shunt, _) = MockDriver::boxed("Shunt", Behavior::Healthy, bus.clone());
        let mut manager = DeviceManager::from_drivers("Dora", vec![shunt], RetryPolicy::immediate());
        manager.start_all().await;

        manager
            .run_until(Duration::from_millis(10), tokio::time::sleep(Duration::from_millis(45)))
            .await;

        assert!(!bus.published_to(&topic("shunt")).is_empty());
        assert_eq!(manager.statuses()[0].1, DriverState::Disconnected);
    }

    const KEY: &str = "0df4d0395b7d1a876c0c33ecb9e70dcd";

    #[tokio::test]
    async fn test_configured_system_end_to_end() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let closed_port = listener.local_addr().unwrap().port();
        drop(listener);

        let toml = format!(
            r#"
[system]
name = "Dora"

[drivers]
connect_timeout_ms = 200
read_timeout_ms = 200
frame_timeout_ms = 200
retry_initial_secs = 0

[[devices]]
name = "Victron MPPT 100/50"
brand = "victron"
mac_address = "C0:3B:98:12:34:56"
encryption_key = "{KEY}"

[[devices]]
name = "Renogy DCC50S"
brand = "renogy"
ip_address = "127.0.0.1"
port = {closed_port}
"#
        );
        let config = VanConfig::from_toml_str(&toml).unwrap();

        let hub = Arc::new(RadioHub::new());
        let bus = Arc::new(MemoryBus::new());
        let factory = DriverFactory::new(hub.clone(), config.drivers.clone());
        let mut manager = DeviceManager::initialize(&config, &factory, bus.clone()).unwrap();
        assert_eq!(manager.len(), 2);

        // Renogy is unreachable; startup still completes
        assert_eq!(manager.start_all().await, 1);

        let record = SolarChargerRecord {
            device_state: 3,
            charger_error: 0,
            battery_voltage: 13.1,
            battery_current: 2.0,
            yield_today: 0.1,
            pv_power: 26.0,
        };
        let key: van_core::EncryptionKey = KEY.parse().unwrap();
        hub.dispatch(Advertisement::new(
            "C0:3B:98:12:34:56".parse().unwrap(),
            encrypt_record(&key, 0xA057, readout::SOLAR_CHARGER, 1, &record.encode()),
        ));

        let report = manager.run_cycle().await;
        assert_eq!(report.published, 1);
        assert_eq!(report.degraded, 1);
        assert_eq!(report.reconnects_attempted, 1);
        assert_eq!(report.reconnects_succeeded, 0);

        let victron = bus.last_json("Dora/devices/victron_mppt_100_50/status").unwrap();
        assert_eq!(victron["connected"], true);
        assert_eq!(victron["state"], "charging");

        let renogy = bus.last_json("Dora/devices/renogy_dcc50s/status").unwrap();
        assert_eq!(renogy["connected"], false);
        assert_eq!(renogy["device"], "Renogy DCC50S");
        assert!(renogy["error"].is_string());

        // Still unreachable: retried again on the next cycle
        let report = manager.run_cycle().await;
        assert_eq!(report.reconnects_attempted, 1);
        assert_eq!(report.degraded, 2);
        assert_eq!(bus.published_to("Dora/devices/renogy_dcc50s/status").len(), 2);
        assert_eq!(
            manager.statuses()[1],
            ("Renogy DCC50S".to_string(), DriverState::Failed)
        );
    }

    #[test]
    fn test_initialize_rejects_bad_device() {
        let config = VanConfig::from_toml_str(
            r#"
[system]
name = "Dora"

[[devices]]
name = "Victron"
brand = "victron"
mac_address = "not-a-mac"
encryption_key = "0df4d0395b7d1a876c0c33ecb9e70dcd"
"#,
        )
        .unwrap();
        let factory = DriverFactory::new(Arc::new(RadioHub::new()), config.drivers.clone());
        let result = DeviceManager::initialize(&config, &factory, Arc::new(MemoryBus::new()));
        assert!(matches!(
            result,
            Err(ConfigError::InvalidField { field: "mac_address", .. })
        ));
    }

    #[test]
    fn test_event_serialization() {
        let event = ManagerEvent::ConnectFailed {
            device: "Fridge".to_string(),
            error: "refused".to_string(),
            retry_in_ms: 5000,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "connect_failed");
        assert_eq!(json["retry_in_ms"], 5000);
    }
}
