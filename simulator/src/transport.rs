//! Broker client boundary.
//!
//! Device loops only see [`Publish`]; the supervisor opens one client per run
//! generation through a [`Transport`]. [`MqttTransport`] is the rumqttc-backed
//! implementation used by the binary.

use crate::config::RunConfiguration;
use crate::errors::{Error, Result};
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const REQUEST_CAPACITY: usize = 1024;
const INITIAL_BACKOFF_MS: u64 = 100;
const MAX_BACKOFF_MS: u64 = 2000;
const DISCONNECT_FLUSH: Duration = Duration::from_millis(250);

/// Publish capability shared by all device loops of a run.
pub trait Publish: Clone + Send + Sync + 'static {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> impl Future<Output = Result<()>> + Send;

    /// Resolves once the broker has accepted the connection, or with the
    /// first connection error.
    fn connected(&self) -> impl Future<Output = Result<()>> + Send {
        async { Ok(()) }
    }
}

/// Opens run-scoped broker clients.
pub trait Transport: Send + Sync + 'static {
    type Client: Publish;

    /// The returned client stays usable until `scope` is cancelled, even if
    /// the broker cannot be reached yet.
    fn open(&self, config: &RunConfiguration, scope: CancellationToken) -> Self::Client;
}

#[derive(Debug, Clone, PartialEq)]
enum LinkState {
    Connecting,
    Connected,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct MqttClient {
    client: AsyncClient,
    state: watch::Receiver<LinkState>,
}

impl Publish for MqttClient {
    /// Fails fast while the broker is unreachable and never waits on a full
    /// request queue.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        if let LinkState::Connecting | LinkState::Failed(_) = &*self.state.borrow() {
            return Err(Error::Connection("not connected to broker".to_string()));
        }
        self.client
            .try_publish(topic, QoS::AtLeastOnce, false, payload)?;
        Ok(())
    }

    async fn connected(&self) -> Result<()> {
        let mut state = self.state.clone();
        loop {
            let current = state.borrow_and_update().clone();
            match current {
                LinkState::Connecting => {}
                LinkState::Connected => return Ok(()),
                LinkState::Failed(reason) => return Err(Error::Connection(reason)),
            }
            state
                .changed()
                .await
                .map_err(|_| Error::Connection("connection task stopped".to_string()))?;
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct MqttTransport;

impl Transport for MqttTransport {
    type Client = MqttClient;

    fn open(&self, config: &RunConfiguration, scope: CancellationToken) -> MqttClient {
        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(|| format!("sim-{}", uuid::Uuid::new_v4()));

        info!(
            "Connecting to MQTT broker at {} as {}",
            config.broker, client_id
        );

        let mut mqtt_options =
            MqttOptions::new(client_id, config.broker.host.clone(), config.broker.port);
        mqtt_options.set_keep_alive(config.keep_alive);
        mqtt_options.set_clean_session(true);

        let (client, eventloop) = AsyncClient::new(mqtt_options, REQUEST_CAPACITY);
        let (state_tx, state_rx) = watch::channel(LinkState::Connecting);

        tokio::spawn(drive_eventloop(
            eventloop,
            client.clone(),
            state_tx,
            scope,
        ));

        MqttClient {
            client,
            state: state_rx,
        }
    }
}

/// Polls the event loop until the run is cancelled, backing off on errors.
async fn drive_eventloop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    state: watch::Sender<LinkState>,
    scope: CancellationToken,
) {
    let mut backoff_ms = INITIAL_BACKOFF_MS;

    loop {
        tokio::select! {
            _ = scope.cancelled() => break,
            polled = eventloop.poll() => match polled {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        info!("Connected to MQTT broker");
                        backoff_ms = INITIAL_BACKOFF_MS;
                        state.send_replace(LinkState::Connected);
                    } else {
                        warn!("Broker refused connection: {:?}", ack.code);
                        state.send_replace(LinkState::Failed(format!("{:?}", ack.code)));
                    }
                }
                Ok(Event::Incoming(Packet::PubAck(ack))) => {
                    debug!("PubAck for packet {}", ack.pkid);
                }
                Ok(_) => {}
                Err(e) => {
                    error!("MQTT eventloop error: {}. Retrying in {}ms...", e, backoff_ms);
                    state.send_replace(LinkState::Failed(e.to_string()));

                    tokio::select! {
                        _ = scope.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_millis(backoff_ms)) => {}
                    }
                    backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);
                }
            }
        }
    }

    // Best effort: push the DISCONNECT out before dropping the event loop
    if client.try_disconnect().is_ok() {
        let _ = tokio::time::timeout(DISCONNECT_FLUSH, async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;
    }

    info!("MQTT connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::CountAggregator;
    use crate::config::{BrokerAddress, DeviceDescriptor};
    use crate::device_loop::DeviceLoop;
    use crate::metrics::PUBLISH_FAILURES_TOTAL;

    fn unreachable_config() -> RunConfiguration {
        RunConfiguration {
            app_name: "test".to_string(),
            // Port 1 on localhost is refused immediately
            broker: BrokerAddress {
                host: "127.0.0.1".to_string(),
                port: 1,
            },
            client_id: Some("transport-test".to_string()),
            keep_alive: Duration::from_secs(5),
            devices: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_refused_connection_reports_error() {
        let scope = CancellationToken::new();
        let client = MqttTransport.open(&unreachable_config(), scope.clone());

        let outcome = tokio::time::timeout(Duration::from_secs(5), client.connected())
            .await
            .expect("connection attempt should settle");
        assert!(matches!(outcome, Err(Error::Connection(_))));

        scope.cancel();
    }

    #[tokio::test]
    async fn test_publish_fails_after_scope_cancelled() {
        let scope = CancellationToken::new();
        let client = MqttTransport.open(&unreachable_config(), scope.clone());

        scope.cancel();
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert!(client.publish("t", b"{}".to_vec()).await.is_err());
    }

    #[tokio::test]
    async fn test_publish_fails_fast_while_broker_unreachable() {
        let scope = CancellationToken::new();
        let client = MqttTransport.open(&unreachable_config(), scope.clone());

        for attempt in 0..(REQUEST_CAPACITY + 100) {
            let outcome =
                tokio::time::timeout(Duration::from_millis(500), client.publish("t", b"{}".to_vec()))
                    .await
                    .unwrap_or_else(|_| panic!("publish {} blocked", attempt));
            assert!(matches!(outcome, Err(Error::Connection(_))));
        }

        scope.cancel();
    }

    #[tokio::test]
    async fn test_device_loop_keeps_iterating_while_broker_unreachable() {
        let scope = CancellationToken::new();
        let client = MqttTransport.open(&unreachable_config(), scope.clone());

        let iterations = REQUEST_CAPACITY as u64 + 500;
        let mut aggregator = CountAggregator::new(4096);
        let device = DeviceDescriptor {
            topic: "/oneM2M/req/house1".to_string(),
            device_id: "house1".to_string(),
            tag: "temp".to_string(),
            max: 20.0,
            min: 10.0,
            interval_ms: 0,
            count: Some(iterations),
        };

        let failures_before = PUBLISH_FAILURES_TOTAL.get();
        let done = tokio::time::timeout(
            Duration::from_secs(5),
            DeviceLoop::new(device, client, aggregator.handle(), scope.clone()).run(),
        )
        .await
        .expect("device loop must not stall on an unreachable broker");

        assert_eq!(done, iterations);
        assert_eq!(aggregator.drain(), iterations);
        assert!(PUBLISH_FAILURES_TOTAL.get() - failures_before >= iterations as f64);

        scope.cancel();
    }
}
