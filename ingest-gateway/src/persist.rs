//! Write-behind persistence.
//!
//! Readings are queued on a bounded channel and written by a single
//! background task, so a slow database stalls the writer, not the live
//! path. A full queue applies backpressure to the bus consumer. Closing the
//! queue lets the writer drain what is already queued before it exits.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::GatewayError;
use crate::store::{ReadingStore, StoredReading};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistStats {
    pub written: u64,
    pub failed: u64,
}

pub struct PersistQueue {
    tx: RwLock<Option<mpsc::Sender<StoredReading>>>,
}

impl PersistQueue {
    /// Starts the writer task. The handle resolves once the queue is closed
    /// and drained.
    pub fn spawn(
        store: Arc<dyn ReadingStore>,
        capacity: usize,
    ) -> (Self, JoinHandle<PersistStats>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let writer = tokio::spawn(run_writer(rx, store));
        (Self { tx: RwLock::new(Some(tx)) }, writer)
    }

    pub async fn enqueue(&self, reading: StoredReading) -> Result<(), GatewayError> {
        let tx = self
            .tx
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(GatewayError::PersistClosed)?;
        tx.send(reading).await.map_err(|_| GatewayError::PersistClosed)
    }

    /// Further `enqueue` calls fail; already queued readings are still written.
    pub fn close(&self) {
        self.tx.write().unwrap_or_else(PoisonError::into_inner).take();
    }
}

async fn run_writer(
    mut rx: mpsc::Receiver<StoredReading>,
    store: Arc<dyn ReadingStore>,
) -> PersistStats {
    let mut stats = PersistStats::default();
    while let Some(stored) = rx.recv().await {
        match store.save_reading(&stored).await {
            Ok(()) => {
                stats.written += 1;
                debug!(device_id = %stored.device_id, "reading persisted");
            }
            Err(e) => {
                stats.failed += 1;
                error!(
                    error = %e,
                    device_id = %stored.device_id,
                    location = %stored.reading.location,
                    category = %stored.reading.category,
                    "failed to persist reading"
                );
            }
        }
    }
    info!(written = stats.written, failed = stats.failed, "persist writer stopped");
    stats
}

// ------------------------------------------------------------------ //
//  Retention                                                          //
// ------------------------------------------------------------------ //

/// Periodically prunes raw readings older than `days`. The first pass runs
/// immediately.
pub fn spawn_retention(
    store: Arc<dyn ReadingStore>,
    days: u32,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match store.prune_readings_older_than(days).await {
                        Ok(0) => debug!(days, "retention pass removed nothing"),
                        Ok(removed) => info!(days, removed, "pruned old readings"),
                        Err(e) => warn!(error = %e, days, "retention pass failed"),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}
