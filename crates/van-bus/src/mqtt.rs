//! MQTT gateway backed by rumqttc
//!
//! The rumqttc event loop runs in its own task. Requests from drivers go
//! through the `AsyncClient` request channel and are each bounded by
//! `request_timeout`, so a stalled broker delays a publish but never hangs
//! the acquisition cycle.

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Outgoing, Packet, QoS};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::gateway::{BusError, BusGateway};

/// Delay before polling again after a connection error
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Message retained by the broker and released if this client drops
#[derive(Debug, Clone)]
pub struct LastWill {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Broker connection settings
#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
    /// Upper bound on any single publish/subscribe request
    pub request_timeout: Duration,
    pub last_will: Option<LastWill>,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "van-assistant".to_string(),
            username: None,
            password: None,
            keep_alive: Duration::from_secs(30),
            request_timeout: Duration::from_secs(5),
            last_will: None,
        }
    }
}

/// A message received on a subscribed topic
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// MQTT-backed [`BusGateway`]
pub struct MqttGateway {
    client: AsyncClient,
    request_timeout: Duration,
    connected: watch::Receiver<bool>,
    incoming: broadcast::Sender<IncomingMessage>,
    event_loop: JoinHandle<()>,
}

impl MqttGateway {
    /// Create the client and start its event loop
    ///
    /// Returns immediately; requests queue until the broker accepts the
    /// connection.
    pub fn connect(settings: MqttSettings) -> Self {
        let mut options = MqttOptions::new(&settings.client_id, &settings.host, settings.port);
        options.set_keep_alive(settings.keep_alive);
        if let (Some(u), Some(p)) = (&settings.username, &settings.password) {
            options.set_credentials(u, p);
        }
        if let Some(will) = &settings.last_will {
            options.set_last_will(rumqttc::LastWill::new(
                &will.topic,
                will.payload.clone(),
                QoS::AtLeastOnce,
                true,
            ));
        }

        let (client, mut eventloop) = AsyncClient::new(options, 64);
        let (connected_tx, connected) = watch::channel(false);
        let (incoming, _) = broadcast::channel(100);
        let incoming_tx = incoming.clone();

        info!(host = %settings.host, port = settings.port, "Starting MQTT event loop");

        let event_loop = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("MQTT connected");
                        let _ = connected_tx.send(true);
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let _ = incoming_tx.send(IncomingMessage {
                            topic: publish.topic.clone(),
                            payload: publish.payload.to_vec(),
                        });
                    }
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                        debug!("MQTT disconnect sent, stopping event loop");
                        let _ = connected_tx.send(false);
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if *connected_tx.borrow() {
                            warn!(error = %e, "MQTT connection lost");
                        } else {
                            debug!(error = %e, "MQTT connection attempt failed");
                        }
                        let _ = connected_tx.send(false);
                        sleep(RECONNECT_DELAY).await;
                    }
                }
            }
        });

        Self {
            client,
            request_timeout: settings.request_timeout,
            connected,
            incoming,
            event_loop,
        }
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Wait until the broker has accepted the connection, up to `limit`
    pub async fn wait_connected(&self, limit: Duration) -> bool {
        let mut connected = self.connected.clone();
        let ready = matches!(timeout(limit, connected.wait_for(|c| *c)).await, Ok(Ok(_)));
        ready
    }

    /// Messages arriving on subscribed topics
    pub fn incoming(&self) -> broadcast::Receiver<IncomingMessage> {
        self.incoming.subscribe()
    }

    /// Send a clean DISCONNECT and stop the event loop
    pub async fn disconnect(&self) -> Result<(), BusError> {
        self.bounded(self.client.disconnect()).await
    }

    async fn bounded<F>(&self, request: F) -> Result<(), BusError>
    where
        F: std::future::Future<Output = Result<(), rumqttc::ClientError>>,
    {
        timeout(self.request_timeout, request)
            .await
            .map_err(|_| BusError::Timeout(self.request_timeout))?
            .map_err(BusError::from)
    }
}

impl Drop for MqttGateway {
    fn drop(&mut self) {
        self.event_loop.abort();
    }
}

#[async_trait]
impl BusGateway for MqttGateway {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.bounded(self.client.publish(topic, QoS::AtLeastOnce, false, payload))
            .await
    }

    async fn publish_retained(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.bounded(self.client.publish(topic, QoS::AtLeastOnce, true, payload))
            .await
    }

    async fn subscribe(&self, topic: &str) -> Result<(), BusError> {
        self.bounded(self.client.subscribe(topic, QoS::AtLeastOnce))
            .await
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), BusError> {
        self.bounded(self.client.unsubscribe(topic)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = MqttSettings::default();
        assert_eq!(settings.host, "localhost");
        assert_eq!(settings.port, 1883);
        assert!(settings.last_will.is_none());
    }

    #[tokio::test]
    async fn test_unreachable_broker_never_connects() {
        // Port 9 (discard) on loopback is not an MQTT broker
        let gateway = MqttGateway::connect(MqttSettings {
            host: "127.0.0.1".to_string(),
            port: 9,
            ..MqttSettings::default()
        });
        assert!(!gateway.wait_connected(Duration::from_millis(200)).await);
        assert!(!gateway.is_connected());
    }
}
