//! Periodic settlement history sync
//!
//! Runs independently of the cadence scheduler: one full pass at start, then
//! one pass every `history.interval_secs`. Instruments are processed a few at
//! a time; every request still goes through the fetcher's global gate.

use futures::stream::{self, StreamExt};
use futures::FutureExt;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::collector::FundingUpdater;
use crate::config::HistorySyncConfig;

/// Back-off after a pass that blew up
const LOOP_ERROR_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub total: usize,
    pub success: usize,
    pub records_written: usize,
}

struct SyncLoop {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct HistorySyncService {
    updater: Arc<FundingUpdater>,
    config: HistorySyncConfig,
    join_timeout: Duration,
    last_report: RwLock<Option<SyncReport>>,
    running: Mutex<Option<SyncLoop>>,
}

impl HistorySyncService {
    pub fn new(updater: Arc<FundingUpdater>, config: HistorySyncConfig, join_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            updater,
            config,
            join_timeout,
            last_report: RwLock::new(None),
            running: Mutex::new(None),
        })
    }

    pub async fn last_report(&self) -> Option<SyncReport> {
        self.last_report.read().await.clone()
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// One pass over `instruments`: backfill or incremental update each
    pub async fn sync_once(&self, instruments: &[String]) -> SyncReport {
        let concurrency = self.config.concurrency.max(1);
        info!(
            "History sync over {} instruments (concurrency {})",
            instruments.len(),
            concurrency
        );

        let outcomes: Vec<Option<usize>> = stream::iter(instruments.iter().cloned())
            .map(|symbol| {
                let updater = Arc::clone(&self.updater);
                async move {
                    match updater.update_instrument(&symbol).await {
                        Ok(written) => {
                            debug!("History sync {}: {} records", symbol, written);
                            Some(written)
                        }
                        Err(e) => {
                            warn!("History sync failed for {}: {}", symbol, e);
                            None
                        }
                    }
                }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let report = SyncReport {
            total: instruments.len(),
            success: outcomes.iter().filter(|o| o.is_some()).count(),
            records_written: outcomes.iter().flatten().sum(),
        };
        info!(
            "History sync complete: {}/{} instruments, {} records",
            report.success, report.total, report.records_written
        );
        *self.last_report.write().await = Some(report.clone());
        report
    }

    /// Spawn the sync loop; a no-op when already running or disabled
    pub async fn start(self: &Arc<Self>, instruments: Vec<String>) {
        if !self.config.enabled {
            info!("History sync disabled");
            return;
        }
        let mut running = self.running.lock().await;
        if running.is_some() {
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let service = Arc::clone(self);
        let interval = Duration::from_secs(self.config.interval_secs.max(1));

        let handle = tokio::spawn(async move {
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }
                let wait = match AssertUnwindSafe(service.sync_once(&instruments))
                    .catch_unwind()
                    .await
                {
                    Ok(_) => interval,
                    Err(_) => {
                        error!("History sync pass panicked, retrying in {:?}", LOOP_ERROR_BACKOFF);
                        LOOP_ERROR_BACKOFF
                    }
                };
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = shutdown_rx.changed() => {}
                }
            }
            debug!("History sync loop exited");
        });

        *running = Some(SyncLoop {
            shutdown_tx,
            handle,
        });
        info!("History sync started (every {}s)", interval.as_secs());
    }

    /// Signal the loop and wait a bounded time; a pass in flight finishes
    /// on its own if the wait runs out
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        let _ = running.shutdown_tx.send(true);
        match tokio::time::timeout(self.join_timeout, running.handle).await {
            Ok(_) => info!("History sync stopped"),
            Err(_) => warn!(
                "History sync did not stop within {}s, proceeding anyway",
                self.join_timeout.as_secs()
            ),
        }
    }
}
