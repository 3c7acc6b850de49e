//! Scripted market-data source for unit tests

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::time::Instant;

use super::source::MarketDataSource;
use crate::domain::{FundingRecord, PremiumIndex, TickerVolume};
use crate::error::{FundwatchError, Result};

pub fn record(symbol: &str, funding_time: i64) -> FundingRecord {
    FundingRecord {
        symbol: symbol.to_string(),
        funding_time,
        funding_rate: dec!(0.0001),
        mark_price: dec!(100),
    }
}

pub fn index(symbol: &str, next_funding_time: i64, time: i64) -> PremiumIndex {
    PremiumIndex {
        symbol: symbol.to_string(),
        mark_price: dec!(100),
        index_price: dec!(100),
        last_funding_rate: dec!(0.0001),
        next_funding_time,
        time,
    }
}

type HistoryArgs = (Option<i64>, Option<i64>, usize);

#[derive(Default)]
pub struct FakeSource {
    history: Mutex<HashMap<String, Vec<FundingRecord>>>,
    /// Probes starting before this point see nothing
    visible_from: Mutex<HashMap<String, i64>>,
    forbidden: Mutex<HashSet<String>>,
    rate_limited: Mutex<HashSet<String>>,
    /// Next history request for these symbols panics
    panicking: Mutex<HashSet<String>>,
    snapshot: Mutex<Vec<PremiumIndex>>,
    snapshot_fails: AtomicBool,
    tickers: Mutex<Vec<TickerVolume>>,
    history_calls: AtomicUsize,
    snapshot_calls: AtomicUsize,
    last_history_args: Mutex<Option<HistoryArgs>>,
    issued: Mutex<Vec<Instant>>,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_history(&self, symbol: &str, mut records: Vec<FundingRecord>) {
        records.sort_by_key(|r| r.funding_time);
        self.history
            .lock()
            .unwrap()
            .insert(symbol.to_string(), records);
    }

    pub fn only_after(&self, symbol: &str, ts: i64) {
        self.visible_from
            .lock()
            .unwrap()
            .insert(symbol.to_string(), ts);
    }

    pub fn forbid(&self, symbol: &str) {
        self.forbidden.lock().unwrap().insert(symbol.to_string());
    }

    pub fn rate_limit(&self, symbol: &str) {
        self.rate_limited.lock().unwrap().insert(symbol.to_string());
    }

    pub fn panic_once(&self, symbol: &str) {
        self.panicking.lock().unwrap().insert(symbol.to_string());
    }

    pub fn set_snapshot(&self, snapshot: Vec<PremiumIndex>) {
        *self.snapshot.lock().unwrap() = snapshot;
    }

    pub fn fail_snapshot(&self, fail: bool) {
        self.snapshot_fails.store(fail, Ordering::SeqCst);
    }

    pub fn set_tickers(&self, tickers: &[(&str, i64)]) {
        *self.tickers.lock().unwrap() = tickers
            .iter()
            .map(|(symbol, volume)| TickerVolume {
                symbol: symbol.to_string(),
                quote_volume: Decimal::from(*volume),
            })
            .collect();
    }

    pub fn history_calls(&self) -> usize {
        self.history_calls.load(Ordering::SeqCst)
    }

    pub fn snapshot_calls(&self) -> usize {
        self.snapshot_calls.load(Ordering::SeqCst)
    }

    pub fn last_history_args(&self) -> Option<HistoryArgs> {
        *self.last_history_args.lock().unwrap()
    }

    pub fn issue_times(&self) -> Vec<Instant> {
        self.issued.lock().unwrap().clone()
    }

    fn stamp(&self) {
        self.issued.lock().unwrap().push(Instant::now());
    }
}

#[async_trait]
impl MarketDataSource for FakeSource {
    async fn premium_index(&self) -> Result<Vec<PremiumIndex>> {
        self.stamp();
        self.snapshot_calls.fetch_add(1, Ordering::SeqCst);
        if self.snapshot_fails.load(Ordering::SeqCst) {
            return Err(FundwatchError::Network("snapshot unavailable".into()));
        }
        Ok(self.snapshot.lock().unwrap().clone())
    }

    async fn funding_history(
        &self,
        symbol: &str,
        start_time: Option<i64>,
        end_time: Option<i64>,
        limit: usize,
    ) -> Result<Vec<FundingRecord>> {
        self.stamp();
        self.history_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_history_args.lock().unwrap() = Some((start_time, end_time, limit));

        let blow_up = self.panicking.lock().unwrap().remove(symbol);
        if blow_up {
            panic!("history request for {} blew up", symbol);
        }
        if self.forbidden.lock().unwrap().contains(symbol) {
            return Err(FundwatchError::Forbidden(symbol.to_string()));
        }
        if self.rate_limited.lock().unwrap().contains(symbol) {
            return Err(FundwatchError::RateLimited(symbol.to_string()));
        }

        let start = start_time.unwrap_or(i64::MIN);
        if let Some(visible) = self.visible_from.lock().unwrap().get(symbol) {
            if start < *visible {
                return Ok(Vec::new());
            }
        }
        let end = end_time.unwrap_or(i64::MAX);

        Ok(self
            .history
            .lock()
            .unwrap()
            .get(symbol)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| r.funding_time >= start && r.funding_time <= end)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn ticker_24h(&self) -> Result<Vec<TickerVolume>> {
        self.stamp();
        Ok(self.tickers.lock().unwrap().clone())
    }
}
