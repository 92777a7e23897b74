//! Publish/subscribe contract shared by every bus implementation

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BusError {
    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("Bus request timed out after {0:?}")]
    Timeout(Duration),
    #[error("Publish to {0} rejected")]
    Rejected(String),
}

/// Handle to an already-connected message bus
///
/// Implementations must tolerate concurrent calls from many drivers and
/// must never block a caller indefinitely.
#[async_trait]
pub trait BusGateway: Send + Sync {
    /// Publish one payload on a topic
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError>;

    /// Publish a payload the broker keeps for late subscribers
    async fn publish_retained(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.publish(topic, payload).await
    }

    async fn subscribe(&self, topic: &str) -> Result<(), BusError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), BusError>;
}
