//! Van Agent - Main entry point
//!
//! Loads the device configuration, connects to the MQTT broker, and runs
//! the acquisition loop until Ctrl+C or SIGTERM.

mod settings;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use van_bus::{BusGateway, MqttGateway};
use van_core::{agent_status_topic, load_config, Brand};
use van_drivers::{DeviceManager, DriverFactory, RadioHub};

use settings::{BrokerSettings, OFFLINE, ONLINE};

#[derive(Parser, Debug)]
#[command(name = "van-agent")]
#[command(about = "Van telemetry agent publishing charger status over MQTT")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "van-config.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Run a single acquisition cycle, print its report, and exit
    #[arg(long)]
    once: bool,

    /// Seconds to wait for the broker before starting anyway
    #[arg(long, default_value_t = 10)]
    broker_wait_secs: u64,
}

fn init_logging(log_level: &str) -> Result<()> {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    if std::env::var_os("RUST_LOG").is_some() {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(EnvFilter::from_default_env())
            .with_target(true)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .with_target(true)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Could not listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Could not listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}

#[cfg(feature = "ble")]
async fn start_radio(hub: Arc<RadioHub>, _needed: bool) {
    // Failure marks the hub unavailable; radio drivers then retry on backoff
    let _ = van_drivers::victron::ble::spawn_ble_scanner(hub).await;
}

#[cfg(not(feature = "ble"))]
async fn start_radio(hub: Arc<RadioHub>, needed: bool) {
    if needed {
        warn!("Built without the `ble` feature; Victron devices will report as disconnected");
    }
    hub.set_available(false);
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level)?;

    info!("Van agent v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    info!(
        system = %config.system.name,
        devices = config.devices.len(),
        poll_interval = ?config.system.poll_interval(),
        "Configuration loaded"
    );

    let broker = BrokerSettings::from_env().context("reading broker settings")?;
    let agent_topic = agent_status_topic(&config.system.name);
    let mqtt = Arc::new(MqttGateway::connect(
        broker.mqtt_settings(&config.system.name, &agent_topic),
    ));
    if !mqtt
        .wait_connected(Duration::from_secs(args.broker_wait_secs))
        .await
    {
        warn!(host = %broker.host, port = broker.port, "Broker not reachable yet, continuing");
    }
    let bus: Arc<dyn BusGateway> = mqtt.clone();

    let hub = Arc::new(RadioHub::new());
    let needs_radio = config
        .devices
        .iter()
        .any(|device| device.brand() == Brand::Victron);
    start_radio(hub.clone(), needs_radio).await;

    let factory = DriverFactory::new(hub.clone(), config.drivers.clone());
    let mut manager =
        DeviceManager::initialize(&config, &factory, bus.clone()).context("building drivers")?;

    if let Err(e) = bus.publish_retained(&agent_topic, ONLINE.to_vec()).await {
        warn!(topic = %agent_topic, error = %e, "Could not publish agent status");
    }

    let connected = manager.start_all().await;
    info!(connected, total = manager.len(), "Devices started");

    if args.once {
        let report = manager.run_cycle().await;
        println!("{}", serde_json::to_string_pretty(&report)?);
        manager.stop_all().await;
    } else {
        manager
            .run_until(config.system.poll_interval(), shutdown_signal())
            .await;
    }

    hub.close();
    if let Err(e) = bus.publish_retained(&agent_topic, OFFLINE.to_vec()).await {
        warn!(topic = %agent_topic, error = %e, "Could not publish agent status");
    }
    if let Err(e) = mqtt.disconnect().await {
        warn!(error = %e, "MQTT disconnect failed");
    }

    info!("Van agent stopped");
    Ok(())
}
