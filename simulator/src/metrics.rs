use lazy_static::lazy_static;
use prometheus::{Counter, Encoder, Gauge, Opts, Registry, TextEncoder};
use std::sync::Once;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref PUBLISH_ATTEMPTS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "simulator_publish_attempts_total",
        "Total measurement messages handed to the broker client"
    ))
    .unwrap();
    pub static ref PUBLISH_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "simulator_publish_failures_total",
        "Total publishes rejected by the broker client"
    ))
    .unwrap();
    pub static ref SERIALIZATION_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "simulator_serialization_failures_total",
        "Total messages that could not be serialized"
    ))
    .unwrap();
    pub static ref RELOADS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "simulator_reloads_total",
        "Total configuration reloads applied"
    ))
    .unwrap();
    pub static ref ACTIVE_DEVICES: Gauge = Gauge::with_opts(Opts::new(
        "simulator_active_devices",
        "Device loops currently running"
    ))
    .unwrap();
}

static INIT: Once = Once::new();

pub fn init_metrics() {
    INIT.call_once(|| {
        REGISTRY
            .register(Box::new(PUBLISH_ATTEMPTS_TOTAL.clone()))
            .unwrap();
        REGISTRY
            .register(Box::new(PUBLISH_FAILURES_TOTAL.clone()))
            .unwrap();
        REGISTRY
            .register(Box::new(SERIALIZATION_FAILURES_TOTAL.clone()))
            .unwrap();
        REGISTRY.register(Box::new(RELOADS_TOTAL.clone())).unwrap();
        REGISTRY.register(Box::new(ACTIVE_DEVICES.clone())).unwrap();
    });
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_lists_counters() {
        init_metrics();
        init_metrics();
        PUBLISH_ATTEMPTS_TOTAL.inc();

        let text = gather_metrics();
        assert!(text.contains("simulator_publish_attempts_total"));
        assert!(text.contains("simulator_active_devices"));
    }
}
