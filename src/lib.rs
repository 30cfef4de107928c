//! Modbus RTU energy meter bridge
//!
//! Polls the configured meters over a serial line, decodes their float
//! registers and publishes one JSON reading per meter and cycle to MQTT.
//! Every acknowledged publish refreshes a heartbeat file for an external watchdog.

pub mod config;
pub mod heartbeat;
pub mod metering_modbus;
pub mod models;
pub mod mqtt;
pub mod scheduler;

use chrono::{DateTime, TimeZone};

// Re-export common types for easier access
pub use config::Config;
pub use heartbeat::Heartbeat;
pub use metering_modbus::{bus::RtuBus, MeterPoller};
pub use models::MeterReading;
pub use mqtt::{MqttTelemetry, Publisher};
pub use scheduler::Scheduler;

/// Local time with microseconds and without offset, e.g. `2024-03-01T14:05:09.123456`
pub fn iso_timestamp<Tz: TimeZone>(time: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    return time.format("%Y-%m-%dT%H:%M:%S%.6f").to_string();
}
