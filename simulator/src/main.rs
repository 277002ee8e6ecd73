use axum::{routing::get, Router};
use chrono::Utc;
use clap::Parser;
use m2m_simulator::aggregator::CountAggregator;
use m2m_simulator::config::RunConfiguration;
use m2m_simulator::supervisor::Supervisor;
use m2m_simulator::transport::MqttTransport;
use m2m_simulator::{metrics, reload, signals};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "m2m-simulator",
    version,
    about = "Publishes synthetic oneM2M sensor readings to an MQTT broker"
)]
struct Args {
    /// Device configuration file (TOML)
    #[arg(short, long, env = "SIM_CONFIG", default_value = "config.toml")]
    config: PathBuf,

    /// How often to check the configuration file for changes, 0 disables reloading
    #[arg(long, env = "SIM_RELOAD_INTERVAL_SECS", default_value_t = 15)]
    reload_interval_secs: u64,

    /// How long stopped device loops get to exit before they are aborted
    #[arg(long, env = "SIM_GRACE_MS", default_value_t = 1000)]
    grace_ms: u64,

    /// How long a run waits for the broker before starting its loops anyway
    #[arg(long, env = "SIM_CONNECT_TIMEOUT_MS", default_value_t = 5000)]
    connect_timeout_ms: u64,

    /// Capacity of the channel carrying publish counts
    #[arg(long, env = "SIM_CHANNEL_CAPACITY", default_value_t = 1024)]
    channel_capacity: usize,

    /// Serve Prometheus metrics on this address, e.g. 0.0.0.0:9100
    #[arg(long, env = "SIM_METRICS_ADDR")]
    metrics_addr: Option<String>,

    /// Log level used when RUST_LOG is not set
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    init_tracing(&args.log_level);
    metrics::init_metrics();

    info!("Starting M2M simulator");

    let config = match RunConfiguration::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load {}: {}", args.config.display(), e);
            std::process::exit(1);
        }
    };

    info!("Application: {}", config.app_name);
    info!(
        "Broker: {}, Devices: {}",
        config.broker,
        config.devices.len()
    );

    let background = CancellationToken::new();

    if let Some(addr) = args.metrics_addr.clone() {
        tokio::spawn(serve_metrics(addr, background.clone()));
    }

    let (reload_tx, mut reload_rx) = mpsc::channel(4);
    if args.reload_interval_secs > 0 {
        tokio::spawn(reload::watch_config(
            args.config.clone(),
            Duration::from_secs(args.reload_interval_secs),
            config.clone(),
            reload_tx,
            background.clone(),
        ));
    } else {
        info!("Configuration reloading disabled");
        drop(reload_tx);
    }

    let mut aggregator = CountAggregator::new(args.channel_capacity);
    let mut supervisor = Supervisor::new(
        MqttTransport,
        aggregator.handle(),
        Duration::from_millis(args.connect_timeout_ms),
        Duration::from_millis(args.grace_ms),
    );

    supervisor.start_run(&config).await;

    let stop = async {
        if let Err(e) = signals::wait_for_stop_signal().await {
            error!("Failed to listen for stop signals: {}", e);
            std::future::pending::<()>().await;
        }
    };
    tokio::pin!(stop);

    loop {
        tokio::select! {
            _ = aggregator.next() => {}

            Some(new_config) = reload_rx.recv() => {
                info!(
                    "Reloading: {} devices on {}",
                    new_config.devices.len(),
                    new_config.broker
                );
                supervisor.reload(&new_config).await;
            }

            _ = supervisor.finished() => {
                info!("All device loops finished");
                break;
            }

            _ = &mut stop => {
                info!("Received stop signal");
                break;
            }
        }
    }

    let iterations = supervisor.shutdown().await;
    background.cancel();

    let total = aggregator.drain();
    info!(
        "Shutting down: {} messages published ({} in the final run)",
        total, iterations
    );
    println!("{} -- {}", Utc::now().to_rfc3339(), total);
}

/// `RUST_LOG` wins; otherwise the configured level, falling back to "info".
fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn serve_metrics(addr: String, scope: CancellationToken) {
    let app = Router::new().route("/metrics", get(metrics_handler));

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind metrics endpoint to {}: {}", addr, e);
            return;
        }
    };

    info!("Metrics endpoint listening on {}", addr);

    let shutdown = async move { scope.cancelled().await };
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!("Metrics server error: {}", e);
    }
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}
