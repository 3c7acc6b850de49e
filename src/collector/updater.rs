//! Fetch-and-persist for funding data
//!
//! A batch update takes one premium index snapshot, writes realtime state for
//! the batch, then brings each instrument's settlement history up to date:
//! a full forward backfill the first time, a small incremental page after.

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use super::fetcher::RateLimitedFetcher;
use super::runner::BatchUpdater;
use crate::clock::Clock;
use crate::domain::{Cadence, FundingRecord, RealtimeState};
use crate::error::{FundwatchError, Result};
use crate::persistence::FundingStore;

/// Page size of incremental updates
const INCREMENTAL_LIMIT: usize = 10;

/// Incremental window when nothing is on record
const DEFAULT_LOOKBACK_HOURS: i64 = 8;

pub struct FundingUpdater {
    fetcher: Arc<RateLimitedFetcher>,
    store: Arc<dyn FundingStore>,
    clock: Arc<dyn Clock>,
}

impl FundingUpdater {
    pub fn new(
        fetcher: Arc<RateLimitedFetcher>,
        store: Arc<dyn FundingStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            fetcher,
            store,
            clock,
        }
    }

    /// Walk an instrument's history forward from its discovered start.
    ///
    /// Pages advance the cursor to one millisecond past the newest record and
    /// stop on a short page or at the page cap. The returned records are
    /// sorted by settlement time with duplicates removed.
    #[instrument(skip(self))]
    pub async fn fetch_full_history(&self, symbol: &str) -> Result<Vec<FundingRecord>> {
        let config = self.fetcher.config();
        let page_size = config.page_size.max(1);
        let mut cursor = self.fetcher.discover_start_time(symbol).await;
        let mut all: Vec<FundingRecord> = Vec::new();

        for page in 1..=config.max_pages {
            let mut records = self
                .fetcher
                .fetch_history(symbol, Some(cursor), None, page_size)
                .await?;
            if records.is_empty() {
                debug!("No more data for {} after page {}", symbol, page - 1);
                break;
            }

            let fetched = records.len();
            let latest = records
                .iter()
                .map(|r| r.funding_time)
                .max()
                .unwrap_or(cursor);
            all.append(&mut records);

            if latest < cursor {
                warn!("Cursor for {} did not advance, stopping", symbol);
                break;
            }
            cursor = latest + 1;

            if fetched < page_size {
                debug!("Reached end of history for {} on page {}", symbol, page);
                break;
            }
            if page == config.max_pages {
                warn!(
                    "Reached maximum page count ({}) for {}",
                    config.max_pages, symbol
                );
            }
        }

        all.sort_by_key(|r| r.funding_time);
        all.dedup_by_key(|r| r.funding_time);
        Ok(all)
    }

    /// First-time history load; returns the number of records written
    pub async fn backfill(&self, symbol: &str) -> Result<usize> {
        let records = self.fetch_full_history(symbol).await?;
        if records.is_empty() {
            info!("No historical data found for {}", symbol);
            return Ok(0);
        }

        let written = self.store.upsert_history(&records).await?;
        info!(
            "Backfilled {} records for {} ({} to {})",
            written,
            symbol,
            records[0].funding_time,
            records[records.len() - 1].funding_time
        );
        Ok(written)
    }

    /// Records settled after `latest` (or in the default lookback window)
    pub async fn update_since(&self, symbol: &str, latest: Option<i64>) -> Result<usize> {
        let end = self.clock.now_millis();
        let start = match latest {
            Some(latest) => latest + 1,
            None => end - ChronoDuration::hours(DEFAULT_LOOKBACK_HOURS).num_milliseconds(),
        };
        if start >= end {
            debug!("{} already up to date", symbol);
            return Ok(0);
        }

        let records = self
            .fetcher
            .fetch_history(symbol, Some(start), Some(end), INCREMENTAL_LIMIT)
            .await?;
        if records.is_empty() {
            return Ok(0);
        }
        self.store.upsert_history(&records).await
    }

    /// Backfill when nothing is on record, otherwise an incremental page
    pub async fn update_instrument(&self, symbol: &str) -> Result<usize> {
        match self.store.latest_settlement_time(symbol).await? {
            None => self.backfill(symbol).await,
            Some(latest) => self.update_since(symbol, Some(latest)).await,
        }
    }
}

#[async_trait]
impl BatchUpdater for FundingUpdater {
    async fn update_batch(&self, instruments: &[String], cadence: Cadence) -> Result<()> {
        let snapshot = self.fetcher.premium_index().await?;
        let by_symbol: HashMap<&str, _> = snapshot.iter().map(|i| (i.symbol.as_str(), i)).collect();

        let states: Vec<RealtimeState> = instruments
            .iter()
            .filter_map(|symbol| by_symbol.get(symbol.as_str()))
            .map(|index| RealtimeState::from(*index))
            .collect();
        if !states.is_empty() {
            self.store.upsert_realtime(&states).await?;
        }

        for symbol in instruments {
            if self.fetcher.is_blacklisted(symbol) {
                debug!("Skipping blacklisted {}", symbol);
                continue;
            }
            if !by_symbol.contains_key(symbol.as_str()) {
                debug!("{} missing from snapshot, skipping", symbol);
                continue;
            }
            match self.update_instrument(symbol).await {
                Ok(written) => debug!("{} {}: {} records", cadence, symbol, written),
                Err(FundwatchError::Forbidden(_)) => {
                    warn!("{} became forbidden, skipping", symbol);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
