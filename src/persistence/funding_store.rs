//! Funding data persistence boundary
//!
//! History is upserted by `(symbol, funding_time)`, realtime state by
//! `symbol`. The verifier only needs the newest realtime update per symbol.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

use crate::domain::{FundingRecord, RealtimeState};
use crate::error::Result;

#[async_trait]
pub trait FundingStore: Send + Sync {
    /// Upsert settlement records; returns the number written
    async fn upsert_history(&self, records: &[FundingRecord]) -> Result<usize>;

    /// Upsert latest-value state; returns the number written
    async fn upsert_realtime(&self, states: &[RealtimeState]) -> Result<usize>;

    /// Most recent settlement time on record (ms), if any
    async fn latest_settlement_time(&self, symbol: &str) -> Result<Option<i64>>;

    /// Most recent realtime update per symbol; symbols without one are absent
    async fn latest_realtime_updates(
        &self,
        symbols: &[String],
    ) -> Result<HashMap<String, DateTime<Utc>>>;
}

/// Store kept entirely in memory, used without a database and in tests
#[derive(Default)]
pub struct MemoryFundingStore {
    history: RwLock<HashMap<String, BTreeMap<i64, FundingRecord>>>,
    realtime: RwLock<HashMap<String, RealtimeState>>,
}

impl MemoryFundingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn history_for(&self, symbol: &str) -> Vec<FundingRecord> {
        self.history
            .read()
            .await
            .get(symbol)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn realtime_for(&self, symbol: &str) -> Option<RealtimeState> {
        self.realtime.read().await.get(symbol).cloned()
    }
}

#[async_trait]
impl FundingStore for MemoryFundingStore {
    async fn upsert_history(&self, records: &[FundingRecord]) -> Result<usize> {
        let mut history = self.history.write().await;
        for record in records {
            history
                .entry(record.symbol.clone())
                .or_default()
                .insert(record.funding_time, record.clone());
        }
        Ok(records.len())
    }

    async fn upsert_realtime(&self, states: &[RealtimeState]) -> Result<usize> {
        let mut realtime = self.realtime.write().await;
        for state in states {
            realtime.insert(state.symbol.clone(), state.clone());
        }
        Ok(states.len())
    }

    async fn latest_settlement_time(&self, symbol: &str) -> Result<Option<i64>> {
        Ok(self
            .history
            .read()
            .await
            .get(symbol)
            .and_then(|records| records.keys().next_back().copied()))
    }

    async fn latest_realtime_updates(
        &self,
        symbols: &[String],
    ) -> Result<HashMap<String, DateTime<Utc>>> {
        let realtime = self.realtime.read().await;
        Ok(symbols
            .iter()
            .filter_map(|symbol| {
                realtime
                    .get(symbol)
                    .and_then(|state| state.event_datetime())
                    .map(|ts| (symbol.clone(), ts))
            })
            .collect())
    }
}
