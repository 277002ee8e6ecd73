//! One publishing task per simulated device.

use crate::aggregator::CountHandle;
use crate::config::DeviceDescriptor;
use crate::generator::{RandomValueGenerator, ValueSource};
use crate::message::MeasurementMessageBuilder;
use crate::metrics::{
    ACTIVE_DEVICES, PUBLISH_ATTEMPTS_TOTAL, PUBLISH_FAILURES_TOTAL, SERIALIZATION_FAILURES_TOTAL,
};
use crate::transport::Publish;
use prometheus::Gauge;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Correlation counters start somewhere in `[0, SERIAL_SPAN)`.
pub const SERIAL_SPAN: u64 = 100_000_000;

/// Holds one unit of a gauge; released on drop, including when the task is aborted.
struct GaugeGuard(Gauge);

impl GaugeGuard {
    fn hold(gauge: &Gauge) -> Self {
        gauge.inc();
        Self(gauge.clone())
    }
}

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        self.0.dec();
    }
}

pub struct DeviceLoop<P, V = RandomValueGenerator> {
    device: DeviceDescriptor,
    builder: MeasurementMessageBuilder<V>,
    publisher: P,
    counts: CountHandle,
    scope: CancellationToken,
    sequence: u64,
}

impl<P: Publish> DeviceLoop<P> {
    pub fn new(
        device: DeviceDescriptor,
        publisher: P,
        counts: CountHandle,
        scope: CancellationToken,
    ) -> Self {
        let mut generator = RandomValueGenerator::new();
        let sequence = generator.serial_seed(SERIAL_SPAN);
        Self::with_builder(
            device,
            MeasurementMessageBuilder::with_source(generator),
            publisher,
            counts,
            scope,
        )
        .starting_at(sequence)
    }
}

impl<P: Publish, V: ValueSource> DeviceLoop<P, V> {
    pub fn with_builder(
        device: DeviceDescriptor,
        builder: MeasurementMessageBuilder<V>,
        publisher: P,
        counts: CountHandle,
        scope: CancellationToken,
    ) -> Self {
        Self {
            device,
            builder,
            publisher,
            counts,
            scope,
            sequence: 0,
        }
    }

    /// The first message carries `sequence + 1`.
    pub fn starting_at(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    /// Runs until the scope is cancelled or the device's `count` is reached.
    /// Returns the number of iterations performed.
    pub async fn run(mut self) -> u64 {
        info!("start device loop {}", self.device.tag);
        let _active = GaugeGuard::hold(&ACTIVE_DEVICES);

        let mut iterations = 0u64;
        loop {
            self.sequence += 1;
            iterations += 1;

            self.publish_once().await;

            // Counts attempts, not confirmed deliveries
            if let Err(e) = self.counts.add_one(&self.scope).await {
                error!("Device {} could not report its count: {}", self.device.address(), e);
            }

            if self.scope.is_cancelled() {
                info!(
                    "canceled by context {} {}",
                    self.device.tag, self.device.interval_ms
                );
                break;
            }

            if self.device.count.is_some_and(|limit| iterations >= limit) {
                info!(
                    "Device {} finished after {} iterations",
                    self.device.address(),
                    iterations
                );
                break;
            }

            if !self.pause().await {
                info!(
                    "canceled by context {} {}",
                    self.device.tag, self.device.interval_ms
                );
                break;
            }
        }

        iterations
    }

    async fn publish_once(&mut self) {
        let message = self.builder.build(&self.device, self.sequence);

        let payload = match message.to_bytes() {
            Ok(p) => p,
            Err(e) => {
                error!(
                    "Failed to serialize message {}: {}",
                    message.correlation_id, e
                );
                SERIALIZATION_FAILURES_TOTAL.inc();
                return;
            }
        };

        PUBLISH_ATTEMPTS_TOTAL.inc();
        match self.publisher.publish(&self.device.topic, payload).await {
            Ok(()) => {
                debug!(
                    "Published {} to {} ({} = {})",
                    message.correlation_id,
                    self.device.topic,
                    message.to,
                    message.value()
                );
            }
            Err(e) => {
                PUBLISH_FAILURES_TOTAL.inc();
                warn!(
                    "Failed to publish {} to {}: {}",
                    message.correlation_id, self.device.topic, e
                );
            }
        }
    }

    /// Sleeps for the device interval. Returns `false` if cancelled meanwhile.
    async fn pause(&self) -> bool {
        let interval = self.device.interval();
        if interval.is_zero() {
            tokio::task::yield_now().await;
            return !self.scope.is_cancelled();
        }

        tokio::select! {
            _ = self.scope.cancelled() => false,
            _ = tokio::time::sleep(interval) => true,
        }
    }
}
