//! Waste-bin telemetry ingestion.
//!
//! Consumes device payloads from the message bus, attributes them to a device,
//! drains the simulated battery, keeps the most recent readings in memory,
//! persists them and fans them out to live dashboard connections.

pub mod battery;
pub mod bus;
pub mod codec;
pub mod config;
pub mod error;
pub mod gateway;
pub mod http;
pub mod live_cache;
pub mod persist;
pub mod routing;
pub mod store;
pub mod subscribers;
