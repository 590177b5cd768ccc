//! # Weather Station Simulator
//!
//! Weather Station Simulator pretends to be a weather station: every cycle
//! it draws a random [`observation::Observation`] and forwards it to
//! ThingSpeak, a Blynk dashboard and an MQTT broker through the
//! [`sink::Sink`] implementations in [`sinks`]. The [`driver::CycleDriver`]
//! runs the cycles and reports what each destination did.

pub mod config;
pub mod connection;
pub mod driver;
pub mod http;
pub mod logging;
pub mod observation;
pub mod sink;
pub mod sinks;
