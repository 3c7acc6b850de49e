use chrono::Duration;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::clock::Clock;
use crate::domain::{Cadence, VerificationResult};
use crate::error::{FundwatchError, Result};
use crate::persistence::FundingStore;

/// Classifies instruments as fresh, stale or missing from their most recent
/// realtime update
pub struct FreshnessVerifier {
    store: Arc<dyn FundingStore>,
    clock: Arc<dyn Clock>,
    grace: Duration,
}

impl FreshnessVerifier {
    pub fn new(store: Arc<dyn FundingStore>, clock: Arc<dyn Clock>, grace: Duration) -> Self {
        Self {
            store,
            clock,
            grace,
        }
    }

    /// Cadence period plus grace
    pub fn max_age(&self, cadence: Cadence) -> Duration {
        cadence.max_age(self.grace)
    }

    pub async fn verify_cadence(
        &self,
        instruments: &[String],
        cadence: Cadence,
    ) -> Result<VerificationResult> {
        self.verify(instruments, cadence, self.max_age(cadence)).await
    }

    /// Store failures surface as `VerificationInfra`, never as findings
    #[instrument(skip(self, instruments), fields(count = instruments.len()))]
    pub async fn verify(
        &self,
        instruments: &[String],
        cadence: Cadence,
        max_age: Duration,
    ) -> Result<VerificationResult> {
        let latest = self
            .store
            .latest_realtime_updates(instruments)
            .await
            .map_err(|e| FundwatchError::VerificationInfra(e.to_string()))?;

        let cutoff = self.clock.now() - max_age;
        let mut result = VerificationResult {
            cadence,
            total: instruments.len(),
            fresh: Vec::new(),
            missing: Vec::new(),
            stale: Vec::new(),
            success_rate: 1.0,
        };

        for symbol in instruments {
            match latest.get(symbol) {
                None => result.missing.push(symbol.clone()),
                Some(updated) if *updated < cutoff => result.stale.push(symbol.clone()),
                Some(_) => result.fresh.push(symbol.clone()),
            }
        }

        if result.total > 0 {
            result.success_rate = result.fresh.len() as f64 / result.total as f64;
        }

        if result.problematic_count() > 0 {
            warn!(
                "{} verification: {}/{} fresh, {} missing, {} stale",
                cadence,
                result.fresh.len(),
                result.total,
                result.missing.len(),
                result.stale.len()
            );
        } else {
            info!("{} verification: all {} fresh", cadence, result.total);
        }
        Ok(result)
    }
}
