//! Broker settings taken from the environment

use std::time::Duration;
use thiserror::Error;
use van_bus::{LastWill, MqttSettings};

pub const OFFLINE: &[u8] = b"offline";
pub const ONLINE: &[u8] = b"online";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SettingsError {
    #[error("{name} must be a port number, got '{value}'")]
    InvalidPort { name: &'static str, value: String },
}

/// MQTT connection settings for the agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Prefix of the MQTT client id
    pub project: String,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            username: "user1".to_string(),
            password: "password1".to_string(),
            project: "van-assistant".to_string(),
        }
    }
}

impl BrokerSettings {
    /// Read `MQTT_HOST`, `MQTT_PORT`, `MQTT_USERNAME`, `MQTT_PASSWORD` and
    /// `COMPOSE_PROJECT_NAME`
    pub fn from_env() -> Result<Self, SettingsError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let port = match get("MQTT_PORT") {
            Some(value) => value
                .trim()
                .parse()
                .map_err(|_| SettingsError::InvalidPort {
                    name: "MQTT_PORT",
                    value,
                })?,
            None => defaults.port,
        };

        Ok(Self {
            host: get("MQTT_HOST").unwrap_or(defaults.host),
            port,
            username: get("MQTT_USERNAME").unwrap_or(defaults.username),
            password: get("MQTT_PASSWORD").unwrap_or(defaults.password),
            project: get("COMPOSE_PROJECT_NAME").unwrap_or(defaults.project),
        })
    }

    /// Client settings for `system`, with an `offline` last will on its
    /// agent status topic
    pub fn mqtt_settings(&self, system: &str, agent_topic: &str) -> MqttSettings {
        MqttSettings {
            host: self.host.clone(),
            port: self.port,
            client_id: format!("{}-{}-agent", self.project, van_core::slugify(system)),
            username: Some(self.username.clone()),
            password: Some(self.password.clone()),
            request_timeout: Duration::from_secs(5),
            last_will: Some(LastWill {
                topic: agent_topic.to_string(),
                payload: OFFLINE.to_vec(),
            }),
            ..MqttSettings::default()
        }
    }
}
