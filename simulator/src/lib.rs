//! Synthetic sensor traffic for a telemetry-ingestion pipeline.
//!
//! One [`device_loop::DeviceLoop`] per configured device publishes oneM2M
//! content-instance requests to an MQTT broker; the
//! [`supervisor::Supervisor`] restarts them on configuration changes and the
//! [`aggregator::CountAggregator`] keeps the total across restarts.

pub mod aggregator;
pub mod config;
pub mod device_loop;
pub mod errors;
pub mod generator;
pub mod message;
pub mod metrics;
pub mod reload;
pub mod signals;
pub mod supervisor;
pub mod transport;
