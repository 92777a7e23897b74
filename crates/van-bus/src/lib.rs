//! Van Bus - Message bus gateway for published telemetry
//!
//! Drivers only ever see the [`BusGateway`] trait. Two implementations are
//! provided: [`MqttGateway`] for a real broker and [`MemoryBus`], which
//! records traffic in process.

pub mod gateway;
pub mod memory;
pub mod mqtt;

pub use gateway::{BusError, BusGateway};
pub use memory::{MemoryBus, Published};
pub use mqtt::{IncomingMessage, LastWill, MqttGateway, MqttSettings};
