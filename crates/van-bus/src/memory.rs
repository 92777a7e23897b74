//! In-process bus that records every request

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::gateway::{BusError, BusGateway};

/// A message captured by [`MemoryBus`]
#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retained: bool,
}

impl Published {
    /// Decode the payload as JSON
    pub fn json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.payload).ok()
    }
}

/// Bus gateway that keeps everything in memory
#[derive(Debug, Default)]
pub struct MemoryBus {
    published: Mutex<Vec<Published>>,
    subscriptions: Mutex<Vec<String>>,
    fail_publish: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent publishes fail (or succeed again)
    pub fn set_fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// All messages published so far, in order
    pub fn published(&self) -> Vec<Published> {
        lock(&self.published).clone()
    }

    /// Messages published on one topic, in order
    pub fn published_to(&self, topic: &str) -> Vec<Published> {
        lock(&self.published)
            .iter()
            .filter(|p| p.topic == topic)
            .cloned()
            .collect()
    }

    /// Most recent payload on a topic, decoded as JSON
    pub fn last_json(&self, topic: &str) -> Option<serde_json::Value> {
        lock(&self.published)
            .iter()
            .rev()
            .find(|p| p.topic == topic)
            .and_then(Published::json)
    }

    pub fn subscriptions(&self) -> Vec<String> {
        lock(&self.subscriptions).clone()
    }

    pub fn clear(&self) {
        lock(&self.published).clear();
    }

    fn record(&self, topic: &str, payload: Vec<u8>, retained: bool) -> Result<(), BusError> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(BusError::Rejected(topic.to_string()));
        }
        lock(&self.published).push(Published {
            topic: topic.to_string(),
            payload,
            retained,
        });
        Ok(())
    }
}

#[async_trait]
impl BusGateway for MemoryBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.record(topic, payload, false)
    }

    async fn publish_retained(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.record(topic, payload, true)
    }

    async fn subscribe(&self, topic: &str) -> Result<(), BusError> {
        let mut subs = lock(&self.subscriptions);
        if !subs.iter().any(|t| t == topic) {
            subs.push(topic.to_string());
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), BusError> {
        lock(&self.subscriptions).retain(|t| t != topic);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_publishes_in_order() {
        let bus = MemoryBus::new();
        bus.publish("a/b", b"1".to_vec()).await.unwrap();
        bus.publish("a/c", b"2".to_vec()).await.unwrap();
        bus.publish_retained("a/b", br#"{"x":3}"#.to_vec())
            .await
            .unwrap();

        assert_eq!(bus.published().len(), 3);
        let to_b = bus.published_to("a/b");
        assert_eq!(to_b.len(), 2);
        assert!(!to_b[0].retained);
        assert!(to_b[1].retained);
        assert_eq!(bus.last_json("a/b").unwrap()["x"], 3);
    }

    #[tokio::test]
    async fn test_fail_publish() {
        let bus = MemoryBus::new();
        bus.set_fail_publish(true);
        assert!(matches!(
            bus.publish("a/b", Vec::new()).await,
            Err(BusError::Rejected(_))
        ));
        assert!(bus.published().is_empty());

        bus.set_fail_publish(false);
        bus.publish("a/b", Vec::new()).await.unwrap();
        assert_eq!(bus.published().len(), 1);
    }

    #[tokio::test]
    async fn test_subscriptions() {
        let bus = MemoryBus::new();
        bus.subscribe("x/#").await.unwrap();
        bus.subscribe("x/#").await.unwrap();
        bus.subscribe("y").await.unwrap();
        assert_eq!(bus.subscriptions(), vec!["x/#", "y"]);

        bus.unsubscribe("x/#").await.unwrap();
        assert_eq!(bus.subscriptions(), vec!["y"]);
    }
}
