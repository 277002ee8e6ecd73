//! Folds "+1" signals from every device loop into one running total.
//!
//! Producers only hold a [`CountHandle`]; the total is written exclusively by
//! the single consumer that owns the [`CountAggregator`].

use crate::errors::{Error, Result};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct CountHandle {
    tx: mpsc::Sender<u64>,
}

impl CountHandle {
    /// Reports one published unit.
    ///
    /// Waits while the consumer is behind. Gives up without error if `scope`
    /// is cancelled during that wait, in which case the unit is not counted.
    pub async fn add_one(&self, scope: &CancellationToken) -> Result<()> {
        match self.tx.try_send(1) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(unit)) => {
                debug!("Count channel full, waiting for the consumer");
                tokio::select! {
                    biased;
                    sent = self.tx.send(unit) => sent.map_err(|_| Error::ChannelSend),
                    _ = scope.cancelled() => Ok(()),
                }
            }
            Err(TrySendError::Closed(_)) => Err(Error::ChannelSend),
        }
    }
}

#[derive(Debug)]
pub struct CountAggregator {
    tx: mpsc::Sender<u64>,
    rx: mpsc::Receiver<u64>,
    total: u64,
}

impl CountAggregator {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self { tx, rx, total: 0 }
    }

    pub fn handle(&self) -> CountHandle {
        CountHandle {
            tx: self.tx.clone(),
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Waits for the next signal and folds it in, returning the new total.
    ///
    /// Cancel-safe, so it can sit in a `select!` next to other event sources.
    pub async fn next(&mut self) -> u64 {
        // The aggregator keeps its own sender, so the channel never closes here
        if let Some(n) = self.rx.recv().await {
            self.total += n;
        }
        self.total
    }

    /// Folds everything already queued without waiting.
    pub fn drain(&mut self) -> u64 {
        while let Ok(n) = self.rx.try_recv() {
            self.total += n;
        }
        self.total
    }
}
