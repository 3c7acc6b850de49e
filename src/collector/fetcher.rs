//! Globally paced access to the market-data source
//!
//! Every outbound request in the process goes through one gate: a mutex around
//! the issue time of the previous request. A caller waits for its turn, sleeps
//! until the minimum interval has elapsed, stamps the gate and issues its
//! request while still holding the lock.

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use dashmap::{DashMap, DashSet};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use super::source::MarketDataSource;
use crate::clock::Clock;
use crate::config::FetcherConfig;
use crate::domain::{FundingRecord, PremiumIndex};
use crate::error::{FundwatchError, Result};
use crate::persistence::CacheStore;

/// Instruments known to answer 403 (delisted or restricted)
pub const SEED_BLACKLIST: [&str; 5] = ["WAVESUSDT", "LUNAUSDT", "USTUSDT", "TERRAUSDT", "ANCUSDT"];

/// Instrument → earliest-known-good timestamp (ms)
pub type StartTimeCache = BTreeMap<String, i64>;

/// Calendar anchors probed oldest-first during start-time discovery
const START_ANCHORS: [(i32, u32, u32); 6] = [
    (2017, 1, 1),
    (2019, 9, 1),
    (2020, 1, 1),
    (2021, 1, 1),
    (2022, 1, 1),
    (2023, 1, 1),
];

const FALLBACK_ANCHOR: (i32, u32, u32) = (2019, 9, 1);
const ANCHOR_PROBE_LIMIT: usize = 10;
const SEARCH_PROBE_LIMIT: usize = 5;
const MIN_SEARCH_GAP_DAYS: i64 = 30;

fn anchor_millis((year, month, day): (i32, u32, u32)) -> i64 {
    Utc.with_ymd_and_hms(year, month, day, 0, 0, 0)
        .single()
        .map(|dt| dt.timestamp_millis())
        .unwrap_or(0)
}

fn format_millis(ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| ms.to_string())
}

pub struct RateLimitedFetcher {
    source: Arc<dyn MarketDataSource>,
    clock: Arc<dyn Clock>,
    config: FetcherConfig,
    /// Issue time of the most recent request
    last_request: Mutex<Option<Instant>>,
    blacklist: DashSet<String>,
    start_times: DashMap<String, i64>,
    start_time_store: Arc<dyn CacheStore<StartTimeCache>>,
    /// Held from snapshot to save so a stale snapshot never lands last
    persist_lock: std::sync::Mutex<()>,
    requests: AtomicU64,
}

impl RateLimitedFetcher {
    /// Build a fetcher and load the persisted start-time cache.
    ///
    /// An unreadable cache is logged and treated as empty.
    pub fn new(
        source: Arc<dyn MarketDataSource>,
        clock: Arc<dyn Clock>,
        config: FetcherConfig,
        start_time_store: Arc<dyn CacheStore<StartTimeCache>>,
    ) -> Self {
        let start_times = DashMap::new();
        match start_time_store.load() {
            Ok(Some(cached)) => {
                info!("Loaded {} cached start times", cached.len());
                for (symbol, ts) in cached {
                    start_times.insert(symbol, ts);
                }
            }
            Ok(None) => {}
            Err(e) => warn!("Failed to load start-time cache, starting empty: {}", e),
        }

        let blacklist = DashSet::new();
        for symbol in SEED_BLACKLIST {
            blacklist.insert(symbol.to_string());
        }

        Self {
            source,
            clock,
            config,
            last_request: Mutex::new(None),
            blacklist,
            start_times,
            start_time_store,
            persist_lock: std::sync::Mutex::new(()),
            requests: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &FetcherConfig {
        &self.config
    }

    pub fn is_blacklisted(&self, symbol: &str) -> bool {
        self.blacklist.contains(symbol)
    }

    pub fn blacklist(&self, symbol: &str) {
        if self.blacklist.insert(symbol.to_string()) {
            warn!("Blacklisted {} after 403", symbol);
        }
    }

    pub fn blacklisted(&self) -> Vec<String> {
        let mut out: Vec<String> = self.blacklist.iter().map(|s| s.key().clone()).collect();
        out.sort();
        out
    }

    /// Outbound requests issued so far
    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn cached_start_time(&self, symbol: &str) -> Option<i64> {
        self.start_times.get(symbol).map(|v| *v)
    }

    /// Run `request` once the global minimum spacing allows it
    async fn paced<T, F, Fut>(&self, request: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let ready_at = previous + self.config.min_request_interval();
            if Instant::now() < ready_at {
                debug!(
                    "Rate limiting: sleeping {:?}",
                    ready_at.saturating_duration_since(Instant::now())
                );
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
        self.requests.fetch_add(1, Ordering::SeqCst);
        request().await
    }

    /// Shared 403/429 handling. Only per-instrument calls (`symbol` set)
    /// can blacklist.
    async fn on_error<T>(
        &self,
        context: &str,
        symbol: Option<&str>,
        err: FundwatchError,
    ) -> Result<T> {
        match (&err, symbol) {
            (FundwatchError::Forbidden(_), Some(symbol)) => {
                self.blacklist(symbol);
            }
            (FundwatchError::RateLimited(_), _) => {
                warn!(
                    "Rate limit exceeded for {}, backing off {:?}",
                    context,
                    self.config.rate_limit_backoff()
                );
                tokio::time::sleep(self.config.rate_limit_backoff()).await;
            }
            (other, _) => debug!("Request for {} failed: {}", context, other),
        }
        Err(err)
    }

    /// Settlement history for one instrument.
    ///
    /// Future start/end timestamps are clamped to now and `limit` is capped at
    /// the page size. Blacklisted instruments fail without a request.
    #[instrument(skip(self))]
    pub async fn fetch_history(
        &self,
        symbol: &str,
        start_time: Option<i64>,
        end_time: Option<i64>,
        limit: usize,
    ) -> Result<Vec<FundingRecord>> {
        if self.is_blacklisted(symbol) {
            return Err(FundwatchError::Forbidden(format!("{} is blacklisted", symbol)));
        }

        let now = self.clock.now_millis();
        let clamp = |ts: Option<i64>, label: &str| {
            ts.map(|t| {
                if t > now {
                    warn!("{} time is in the future for {}, using now", label, symbol);
                    now
                } else {
                    t
                }
            })
        };
        let start_time = clamp(start_time, "Start");
        let end_time = clamp(end_time, "End");
        let limit = limit.clamp(1, self.config.page_size.max(1));

        let result = self
            .paced(|| self.source.funding_history(symbol, start_time, end_time, limit))
            .await;

        match result {
            Ok(records) => Ok(records),
            Err(e) => self.on_error(symbol, Some(symbol), e).await,
        }
    }

    /// Current-state snapshot of every instrument
    #[instrument(skip(self))]
    pub async fn premium_index(&self) -> Result<Vec<PremiumIndex>> {
        match self.paced(|| self.source.premium_index()).await {
            Ok(snapshot) => Ok(snapshot),
            Err(e) => self.on_error("premiumIndex", None, e).await,
        }
    }

    /// USDT-quoted instruments ranked by 24h quote volume
    #[instrument(skip(self))]
    pub async fn top_symbols(&self, limit: usize) -> Result<Vec<String>> {
        let tickers = match self.paced(|| self.source.ticker_24h()).await {
            Ok(tickers) => tickers,
            Err(e) => return self.on_error("ticker/24hr", None, e).await,
        };

        let mut ranked: Vec<_> = tickers
            .into_iter()
            .filter(|t| {
                t.symbol.ends_with("USDT")
                    && t.quote_volume > Decimal::ZERO
                    && !self.is_blacklisted(&t.symbol)
            })
            .collect();
        ranked.sort_by(|a, b| b.quote_volume.cmp(&a.quote_volume));

        let symbols: Vec<String> = ranked.into_iter().take(limit).map(|t| t.symbol).collect();
        info!(
            "Retrieved top {} symbols ({} blacklisted excluded)",
            symbols.len(),
            self.blacklist.len()
        );
        Ok(symbols)
    }

    /// Probe that treats any failure as "no data here"
    async fn has_data_from(&self, symbol: &str, start: i64, limit: usize) -> bool {
        match self.fetch_history(symbol, Some(start), None, limit).await {
            Ok(records) => !records.is_empty(),
            Err(e) => {
                debug!("Probe for {} at {} failed: {}", symbol, format_millis(start), e);
                false
            }
        }
    }

    /// Earliest point from which the instrument has settlement data.
    ///
    /// Anchors are probed oldest-first; when the first anchor with data is
    /// more than 30 days past the floor, a capped binary search narrows the
    /// gap. The result is a conservative lower bound, not the exact first
    /// record. Discovered values are cached and persisted permanently; the
    /// fallback anchor used when nothing is found is returned but not cached.
    #[instrument(skip(self))]
    pub async fn discover_start_time(&self, symbol: &str) -> i64 {
        if let Some(cached) = self.cached_start_time(symbol) {
            debug!("Using cached start time for {}: {}", symbol, format_millis(cached));
            return cached;
        }

        info!("Auto-detecting start time for {}", symbol);
        let now = self.clock.now_millis();
        let floor = anchor_millis(START_ANCHORS[0]);

        let mut earliest_with_data = None;
        for anchor in START_ANCHORS {
            let ts = anchor_millis(anchor);
            if ts > now {
                continue;
            }
            if self.has_data_from(symbol, ts, ANCHOR_PROBE_LIMIT).await {
                info!("Found data for {} starting from {}", symbol, format_millis(ts));
                earliest_with_data = Some(ts);
                break;
            }
        }

        let Some(bound) = earliest_with_data else {
            let fallback = anchor_millis(FALLBACK_ANCHOR);
            warn!(
                "Could not auto-detect start time for {}, using default {}",
                symbol,
                format_millis(fallback)
            );
            return fallback;
        };

        let mut found = bound;
        let min_gap = ChronoDuration::days(MIN_SEARCH_GAP_DAYS).num_milliseconds();
        if bound - floor > min_gap {
            let (mut left, mut right) = (floor, bound);
            let mut probes = 0;
            while left < right && probes < self.config.max_search_probes {
                probes += 1;
                let mid = left + (right - left) / 2;
                if self.has_data_from(symbol, mid, SEARCH_PROBE_LIMIT).await {
                    right = mid;
                    found = mid;
                } else {
                    left = mid + 1;
                }
                tokio::time::sleep(self.config.probe_delay()).await;
            }
            debug!("Binary search for {} finished after {} probes", symbol, probes);
        }

        info!("Auto-detected start time for {}: {}", symbol, format_millis(found));
        self.start_times.insert(symbol.to_string(), found);
        self.persist_start_times();
        found
    }

    fn persist_start_times(&self) {
        let _guard = self
            .persist_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let snapshot: StartTimeCache = self
            .start_times
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        if let Err(e) = self.start_time_store.save(&snapshot) {
            error!("Failed to persist start-time cache: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::collector::test_support::{record, FakeSource};
    use crate::persistence::MemoryStore;
    use proptest::prelude::*;
    use std::time::Duration;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
    }

    fn fetcher_with(
        source: Arc<FakeSource>,
        store: Arc<MemoryStore<StartTimeCache>>,
    ) -> RateLimitedFetcher {
        RateLimitedFetcher::new(
            source,
            Arc::new(ManualClock::new(now())),
            FetcherConfig::default(),
            store,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_forbidden_blacklists_instrument() {
        let source = Arc::new(FakeSource::new());
        source.forbid("DELISTUSDT");
        let fetcher = fetcher_with(source.clone(), Arc::new(MemoryStore::new()));

        let err = fetcher
            .fetch_history("DELISTUSDT", None, None, 10)
            .await
            .unwrap_err();
        assert!(err.is_permanent());
        assert!(fetcher.is_blacklisted("DELISTUSDT"));

        let calls_before = source.history_calls();
        assert!(fetcher.fetch_history("DELISTUSDT", None, None, 10).await.is_err());
        assert_eq!(source.history_calls(), calls_before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_backs_off_without_retry() {
        let source = Arc::new(FakeSource::new());
        source.rate_limit("BTCUSDT");
        let fetcher = fetcher_with(source.clone(), Arc::new(MemoryStore::new()));

        let started = Instant::now();
        let err = fetcher
            .fetch_history("BTCUSDT", None, None, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, FundwatchError::RateLimited(_)));
        assert!(started.elapsed() >= Duration::from_millis(5000));
        assert_eq!(source.history_calls(), 1);
        assert!(!fetcher.is_blacklisted("BTCUSDT"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_future_timestamps_are_clamped() {
        let source = Arc::new(FakeSource::new());
        let fetcher = fetcher_with(source.clone(), Arc::new(MemoryStore::new()));
        let future = now().timestamp_millis() + 3_600_000;

        fetcher
            .fetch_history("BTCUSDT", Some(future), Some(future), 5000)
            .await
            .unwrap();

        let (start, end, limit) = source.last_history_args().unwrap();
        assert_eq!(start, Some(now().timestamp_millis()));
        assert_eq!(end, Some(now().timestamp_millis()));
        assert_eq!(limit, 1000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_top_symbols_ranking() {
        let source = Arc::new(FakeSource::new());
        source.set_tickers(&[
            ("ETHUSDT", 500),
            ("BTCUSDT", 900),
            ("LUNAUSDT", 10_000),
            ("BTCBUSD", 2_000),
            ("DEADUSDT", 0),
            ("SOLUSDT", 300),
        ]);
        let fetcher = fetcher_with(source, Arc::new(MemoryStore::new()));

        let top = fetcher.top_symbols(2).await.unwrap();
        assert_eq!(top, vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_is_cached_and_idempotent() {
        let source = Arc::new(FakeSource::new());
        // Listed 2020-06-15; first anchor with data is 2017-01-01 since
        // probes return anything at or after the start time.
        let listed = Utc.with_ymd_and_hms(2020, 6, 15, 0, 0, 0).unwrap();
        source.set_history(
            "NEWUSDT",
            (0..20)
                .map(|i| record("NEWUSDT", listed.timestamp_millis() + i * 28_800_000))
                .collect(),
        );
        let store = Arc::new(MemoryStore::new());
        let fetcher = fetcher_with(source.clone(), store.clone());

        let first = fetcher.discover_start_time("NEWUSDT").await;
        assert!(first <= listed.timestamp_millis());
        assert_eq!(store.save_count(), 1);
        assert_eq!(store.snapshot().unwrap()["NEWUSDT"], first);

        let calls = fetcher.request_count();
        let second = fetcher.discover_start_time("NEWUSDT").await;
        assert_eq!(first, second);
        assert_eq!(fetcher.request_count(), calls);
        assert_eq!(store.save_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_discoveries_persist_every_symbol() {
        let source = Arc::new(FakeSource::new());
        let listed = Utc.with_ymd_and_hms(2020, 6, 15, 0, 0, 0).unwrap();
        for symbol in ["AUSDT", "BUSDT", "CUSDT"] {
            source.set_history(symbol, vec![record(symbol, listed.timestamp_millis())]);
        }
        let store = Arc::new(MemoryStore::new());
        let fetcher = Arc::new(fetcher_with(source, store.clone()));

        let handles: Vec<_> = ["AUSDT", "BUSDT", "CUSDT"]
            .into_iter()
            .map(|symbol| {
                let fetcher = fetcher.clone();
                tokio::spawn(async move { fetcher.discover_start_time(symbol).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let persisted = store.snapshot().unwrap();
        assert_eq!(persisted.len(), 3);
        assert_eq!(store.save_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_binary_search_is_capped() {
        let source = Arc::new(FakeSource::new());
        source.set_history(
            "LATEUSDT",
            vec![record(
                "LATEUSDT",
                Utc.with_ymd_and_hms(2022, 3, 1, 0, 0, 0)
                    .unwrap()
                    .timestamp_millis(),
            )],
        );
        let fetcher = fetcher_with(source.clone(), Arc::new(MemoryStore::new()));

        let found = fetcher.discover_start_time("LATEUSDT").await;
        // Probes return anything at or after their start, so the oldest
        // anchor already has data and no search is needed.
        assert_eq!(found, anchor_millis(START_ANCHORS[0]));
        assert_eq!(source.history_calls(), 1);

        let source = Arc::new(FakeSource::new());
        source.set_history(
            "GAPUSDT",
            vec![record(
                "GAPUSDT",
                Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0)
                    .unwrap()
                    .timestamp_millis(),
            )],
        );
        source.only_after("GAPUSDT", anchor_millis((2023, 1, 1)));
        let fetcher = fetcher_with(source.clone(), Arc::new(MemoryStore::new()));

        let found = fetcher.discover_start_time("GAPUSDT").await;
        // Every search probe lands before the visible window, so the
        // anchor stays the answer after the ten-probe cap.
        assert_eq!(found, anchor_millis((2023, 1, 1)));
        assert_eq!(source.history_calls(), START_ANCHORS.len() + 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_fallback_is_not_cached() {
        let source = Arc::new(FakeSource::new());
        let store = Arc::new(MemoryStore::new());
        let fetcher = fetcher_with(source, store.clone());

        let found = fetcher.discover_start_time("EMPTYUSDT").await;
        assert_eq!(found, anchor_millis(FALLBACK_ANCHOR));
        assert!(fetcher.cached_start_time("EMPTYUSDT").is_none());
        assert_eq!(store.save_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loads_persisted_start_times() {
        let mut cached = StartTimeCache::new();
        cached.insert("BTCUSDT".to_string(), 1_567_296_000_000);
        let store = Arc::new(MemoryStore::with_value(cached));
        let source = Arc::new(FakeSource::new());
        let fetcher = fetcher_with(source.clone(), store);

        assert_eq!(fetcher.discover_start_time("BTCUSDT").await, 1_567_296_000_000);
        assert_eq!(source.history_calls(), 0);
    }

    fn spacing_holds(callers: usize, interval_ms: u64) -> bool {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
            .unwrap();

        runtime.block_on(async move {
            let source = Arc::new(FakeSource::new());
            let config = FetcherConfig {
                min_request_interval_ms: interval_ms,
                ..FetcherConfig::default()
            };
            let fetcher = Arc::new(RateLimitedFetcher::new(
                source.clone(),
                Arc::new(ManualClock::new(now())),
                config,
                Arc::new(MemoryStore::<StartTimeCache>::new()),
            ));

            let handles: Vec<_> = (0..callers)
                .map(|i| {
                    let fetcher = fetcher.clone();
                    tokio::spawn(async move {
                        let symbol = format!("SYM{}USDT", i);
                        let _ = fetcher.fetch_history(&symbol, None, None, 10).await;
                        let _ = fetcher.premium_index().await;
                    })
                })
                .collect();
            for handle in handles {
                handle.await.unwrap();
            }

            let issued = source.issue_times();
            issued.len() == callers * 2
                && issued
                    .windows(2)
                    .all(|w| w[1].duration_since(w[0]) >= Duration::from_millis(interval_ms))
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_requests_respect_min_interval(callers in 1usize..6, interval_ms in 1500u64..4000) {
            prop_assert!(spacing_holds(callers, interval_ms));
        }
    }
}
