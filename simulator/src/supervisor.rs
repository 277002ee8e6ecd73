//! # Supervisor: owns run generations of device loops.
//!
//! Every run gets its own [`CancellationToken`] (a child of the supervisor's
//! root token), one broker client opened through the [`Transport`], and one
//! [`DeviceLoop`] per configured device, tracked in a [`JoinSet`].
//!
//! ```text
//! start_run(cfg) ──► scope = root.child_token()
//!                    client = transport.open(cfg, scope)
//!                    for device in cfg.devices: set.spawn(DeviceLoop::run)
//!
//! reload(cfg)    ──► scope.cancel() ──► join set within grace ──► start_run(cfg)
//!
//! shutdown()     ──► root.cancel()  ──► join set within grace
//! ```
//!
//! The running total lives outside the supervisor, so reloads never reset it.

use crate::aggregator::CountHandle;
use crate::config::RunConfiguration;
use crate::device_loop::DeviceLoop;
use crate::metrics::RELOADS_TOTAL;
use crate::transport::{Publish, Transport};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

struct Run {
    generation: u64,
    scope: CancellationToken,
    loops: JoinSet<u64>,
    /// Iterations of loops already joined by `finished`.
    joined_iterations: u64,
}

pub struct Supervisor<T: Transport> {
    transport: T,
    counts: CountHandle,
    root: CancellationToken,
    connect_timeout: Duration,
    grace: Duration,
    generation: u64,
    current: Option<Run>,
}

impl<T: Transport> Supervisor<T> {
    pub fn new(
        transport: T,
        counts: CountHandle,
        connect_timeout: Duration,
        grace: Duration,
    ) -> Self {
        Self {
            transport,
            counts,
            root: CancellationToken::new(),
            connect_timeout,
            grace,
            generation: 0,
            current: None,
        }
    }

    /// Starts one device loop per configured device and returns the new
    /// run's scope. An already active run is cancelled without waiting.
    pub async fn start_run(&mut self, config: &RunConfiguration) -> CancellationToken {
        if let Some(previous) = self.current.take() {
            previous.scope.cancel();
        }

        self.generation += 1;
        let scope = self.root.child_token();
        let client = self.transport.open(config, scope.clone());

        match tokio::time::timeout(self.connect_timeout, client.connected()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("{}; device loops start anyway", e),
            Err(_) => error!(
                "No connection to {} after {:?}; device loops start anyway",
                config.broker, self.connect_timeout
            ),
        }

        let mut loops = JoinSet::new();
        for device in &config.devices {
            let device_loop = DeviceLoop::new(
                device.clone(),
                client.clone(),
                self.counts.clone(),
                scope.clone(),
            );
            loops.spawn(device_loop.run());
        }

        info!(
            "{}: run {} started with {} devices",
            config.app_name,
            self.generation,
            config.devices.len()
        );

        self.current = Some(Run {
            generation: self.generation,
            scope: scope.clone(),
            loops,
            joined_iterations: 0,
        });
        scope
    }

    /// Stops the current run, then starts a fresh one from `config`.
    pub async fn reload(&mut self, config: &RunConfiguration) -> CancellationToken {
        RELOADS_TOTAL.inc();
        self.stop_current().await;
        self.start_run(config).await
    }

    /// Cancels everything and waits for the loops within the grace period.
    /// Returns the iterations performed by the current run's joined loops,
    /// including those that already finished on their own.
    pub async fn shutdown(&mut self) -> u64 {
        self.root.cancel();
        self.stop_current().await
    }

    /// Number of device loops in the current run that have not been joined.
    pub fn active_loops(&self) -> usize {
        self.current.as_ref().map_or(0, |run| run.loops.len())
    }

    /// Resolves once every loop of the current run ended by itself, which
    /// only happens when all devices have an iteration `count`.
    /// Never resolves without an active, non-empty run.
    pub async fn finished(&mut self) {
        match self.current.as_mut() {
            Some(run) if !run.loops.is_empty() => {
                while let Some(joined) = run.loops.join_next().await {
                    match joined {
                        Ok(n) => run.joined_iterations += n,
                        Err(e) => error!("Device loop task failed: {}", e),
                    }
                }
            }
            _ => std::future::pending().await,
        }
    }

    async fn stop_current(&mut self) -> u64 {
        let Some(mut run) = self.current.take() else {
            return 0;
        };

        run.scope.cancel();

        let grace = self.grace;
        let mut iterations = run.joined_iterations;
        let joined = tokio::time::timeout(grace, async {
            while let Some(joined) = run.loops.join_next().await {
                match joined {
                    Ok(n) => iterations += n,
                    Err(e) => error!("Device loop task failed: {}", e),
                }
            }
        })
        .await;

        match joined {
            Ok(()) => info!("Run {} stopped", run.generation),
            Err(_) => {
                warn!(
                    "Run {}: {} device loops still alive after {:?}, aborting them",
                    run.generation,
                    run.loops.len(),
                    grace
                );
                run.loops.abort_all();
            }
        }

        iterations
    }
}
