//! Polls Eastron SDM energy meters over Modbus RTU
//!
//! Readings are kept in memory, published to MQTT and served over a small
//! HTTP API.

pub mod api;
pub mod config;
pub mod db;
pub mod metering_modbus;
pub mod models;
pub mod mqtt;
pub mod runner;

// Re-export common types for easier access
pub use config::Config;
pub use db::DataStore;
pub use metering_modbus::PollLoop;
pub use models::{MeterConfig, MeterModel, Reading};
pub use mqtt::{MeteringData, MessagePublisher, MqttManager, MqttSink};
pub use runner::Runner;
