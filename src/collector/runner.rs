use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::ExtractionConfig;
use crate::domain::{BatchResult, Cadence};
use crate::error::Result;

/// One fetch-and-persist call over a batch of instruments.
///
/// An error fails the whole batch.
#[async_trait]
pub trait BatchUpdater: Send + Sync {
    async fn update_batch(&self, instruments: &[String], cadence: Cadence) -> Result<()>;
}

/// Splits an instrument list into bounded batches and runs them in order
pub struct BatchExtractionRunner {
    updater: Arc<dyn BatchUpdater>,
    config: ExtractionConfig,
}

impl BatchExtractionRunner {
    pub fn new(updater: Arc<dyn BatchUpdater>, config: ExtractionConfig) -> Self {
        Self { updater, config }
    }

    pub fn batch_size(&self, cadence: Cadence) -> usize {
        let size = if cadence.is_high_frequency() {
            self.config.batch_size_hourly
        } else {
            self.config.batch_size_default
        };
        size.max(1)
    }

    fn error_pause(&self, cadence: Cadence) -> Duration {
        Duration::from_millis(if cadence.is_high_frequency() {
            self.config.error_pause_hourly_ms
        } else {
            self.config.error_pause_default_ms
        })
    }

    /// Run every batch, containing failures to the batch that raised them
    pub async fn extract(&self, instruments: &[String], cadence: Cadence) -> BatchResult {
        let started = Instant::now();
        let batch_size = self.batch_size(cadence);
        let batches = instruments.len().div_ceil(batch_size);
        let mut result = BatchResult {
            total_count: instruments.len(),
            ..BatchResult::default()
        };

        info!(
            "Extracting {} {} instruments in {} batches",
            instruments.len(),
            cadence,
            batches
        );

        for (i, batch) in instruments.chunks(batch_size).enumerate() {
            match self.updater.update_batch(batch, cadence).await {
                Ok(()) => result.successful.extend(batch.iter().cloned()),
                Err(e) => {
                    warn!(
                        "{} batch {}/{} failed ({} instruments): {}",
                        cadence,
                        i + 1,
                        batches,
                        batch.len(),
                        e
                    );
                    result.failed.extend(batch.iter().cloned());
                    tokio::time::sleep(self.error_pause(cadence)).await;
                }
            }
        }

        result.duration = started.elapsed();
        info!(
            "{} extraction finished: {}/{} in {:.1}s",
            cadence,
            result.success_count(),
            result.total_count,
            result.duration.as_secs_f64()
        );
        result
    }
}
