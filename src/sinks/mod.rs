//! Sink implementations
//!
//! Contains TelemetrySink (ThingSpeak), DashboardSink (Blynk) and
//! BrokerSink (MQTT).

pub mod broker;
pub mod dashboard;
pub mod telemetry;

pub use self::broker::{BrokerLink, BrokerSink, PahoLink};
pub use self::dashboard::{Availability, DashboardSink};
pub use self::telemetry::{TelemetryPayload, TelemetrySink};
