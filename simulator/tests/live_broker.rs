//! Needs an MQTT broker on localhost:1883, run with `--ignored`.

use m2m_simulator::aggregator::CountAggregator;
use m2m_simulator::config::RunConfiguration;
use m2m_simulator::message::OutboundMessage;
use m2m_simulator::supervisor::Supervisor;
use m2m_simulator::transport::MqttTransport;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

const CONFIG: &str = r#"
app_name = "live broker test"
server = "tcp://localhost:1883"

[[mqtt]]
topic = "/oneM2M/req/live-test/house1"
dev = "house1"
tag = "temp"
min = 10.0
max = 20.0
interval = 0
count = 500

[[mqtt]]
topic = "/oneM2M/req/live-test/house2"
dev = "house2"
tag = "humidity"
min = 30.0
max = 80.0
interval = 0
count = 500
"#;

#[tokio::test]
#[ignore]
async fn test_publishes_reach_the_broker() {
    println!("\n🚀 Starting live broker test: 2 devices x 500 messages");

    let mut mqtt_options = MqttOptions::new("live-test-subscriber", "localhost", 1883);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    let (subscriber, mut eventloop) = AsyncClient::new(mqtt_options, 1000);
    subscriber
        .subscribe("/oneM2M/req/live-test/#", QoS::AtLeastOnce)
        .await
        .unwrap();

    let received = Arc::new(AtomicU64::new(0));
    let counter = received.clone();
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let message: OutboundMessage =
                        serde_json::from_slice(&publish.payload).unwrap();
                    assert_eq!(message.from, "SiotTestAE");
                    counter.fetch_add(1, Ordering::SeqCst);
                }
                Ok(_) => {}
                Err(e) => {
                    eprintln!("MQTT error: {}", e);
                    break;
                }
            }
        }
    });

    sleep(Duration::from_millis(500)).await;

    let config = RunConfiguration::from_toml_str(CONFIG).unwrap();
    let mut aggregator = CountAggregator::new(2048);
    let mut supervisor = Supervisor::new(
        MqttTransport,
        aggregator.handle(),
        Duration::from_secs(5),
        Duration::from_secs(1),
    );

    supervisor.start_run(&config).await;
    supervisor.finished().await;

    // Give the broker time to deliver before the run's connection closes
    sleep(Duration::from_secs(2)).await;
    supervisor.shutdown().await;

    let total = aggregator.drain();
    let delivered = received.load(Ordering::SeqCst);

    println!("\n📈 Results:");
    println!("  Counted:   {}", total);
    println!("  Delivered: {}", delivered);

    assert_eq!(total, 1000);
    assert_eq!(delivered, 1000);
}
