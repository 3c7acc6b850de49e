#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use fundwatch::clock::{Clock, ManualClock};
use fundwatch::collector::{
    BatchExtractionRunner, BatchUpdater, ClassificationCache, IntervalClassifier,
    MarketDataSource, RateLimitedFetcher, StartTimeCache,
};
use fundwatch::config::{AlertPolicyConfig, ExtractionConfig, FetcherConfig, SchedulerConfig};
use fundwatch::domain::{Cadence, FundingRecord, PremiumIndex, RealtimeState, TickerVolume};
use fundwatch::error::{FundwatchError, Result};
use fundwatch::persistence::{MemoryFundingStore, MemoryStore};
use fundwatch::scheduler::{SchedulerComponents, SchedulerEngine};
use fundwatch::supervisor::{AlertLevel, AlertManager, AlertPolicy, FreshnessVerifier, Notifier};
use fundwatch::FundingStore;
use rust_decimal_macros::dec;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub fn at(day: u32, h: u32, m: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, day, h, m, s).unwrap()
}

/// Serves one fixed premium index snapshot
#[derive(Default)]
pub struct SnapshotSource {
    snapshot: Mutex<Vec<PremiumIndex>>,
    calls: AtomicUsize,
}

impl SnapshotSource {
    pub fn with(entries: &[(&str, DateTime<Utc>)]) -> Self {
        let snapshot = entries
            .iter()
            .map(|(symbol, next)| PremiumIndex {
                symbol: symbol.to_string(),
                mark_price: dec!(100),
                index_price: dec!(100),
                last_funding_rate: dec!(0.0001),
                next_funding_time: next.timestamp_millis(),
                time: 0,
            })
            .collect();
        Self {
            snapshot: Mutex::new(snapshot),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MarketDataSource for SnapshotSource {
    async fn premium_index(&self) -> Result<Vec<PremiumIndex>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.snapshot.lock().unwrap().clone())
    }

    async fn funding_history(
        &self,
        _symbol: &str,
        _start_time: Option<i64>,
        _end_time: Option<i64>,
        _limit: usize,
    ) -> Result<Vec<FundingRecord>> {
        Ok(Vec::new())
    }

    async fn ticker_24h(&self) -> Result<Vec<TickerVolume>> {
        Ok(Vec::new())
    }
}

/// Writes a realtime row stamped with the clock for every instrument in a
/// batch, unless the batch holds a failing instrument
pub struct RecordingUpdater {
    store: Arc<MemoryFundingStore>,
    clock: Arc<ManualClock>,
    failing: Mutex<HashSet<String>>,
    panic_next: AtomicBool,
    calls: Mutex<Vec<(Cadence, Vec<String>)>>,
}

impl RecordingUpdater {
    /// The next batch panics instead of returning
    pub fn panic_once(&self) {
        self.panic_next.store(true, Ordering::SeqCst);
    }

    pub fn fail(&self, symbol: &str) {
        self.failing.lock().unwrap().insert(symbol.to_string());
    }

    pub fn calls(&self) -> Vec<(Cadence, Vec<String>)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn cadences_run(&self) -> Vec<Cadence> {
        self.calls().into_iter().map(|(cadence, _)| cadence).collect()
    }
}

#[async_trait]
impl BatchUpdater for RecordingUpdater {
    async fn update_batch(&self, instruments: &[String], cadence: Cadence) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push((cadence, instruments.to_vec()));
        if self.panic_next.swap(false, Ordering::SeqCst) {
            panic!("{} batch blew up", cadence);
        }
        let failing = self.failing.lock().unwrap().clone();
        if instruments.iter().any(|s| failing.contains(s)) {
            return Err(FundwatchError::Network("upstream timeout".into()));
        }

        let now = self.clock.now_millis();
        let states: Vec<RealtimeState> = instruments
            .iter()
            .map(|symbol| RealtimeState {
                symbol: symbol.clone(),
                mark_price: dec!(100),
                index_price: dec!(100),
                funding_rate: dec!(0.0001),
                next_funding_time: now,
                event_time: now,
            })
            .collect();
        self.store.upsert_realtime(&states).await?;
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(String, AlertLevel)>>,
}

impl RecordingNotifier {
    pub fn titles(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(title, _)| title.clone())
            .collect()
    }

    pub fn count_containing(&self, needle: &str) -> usize {
        self.titles().iter().filter(|t| t.contains(needle)).count()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, title: &str, _body: &str, level: AlertLevel) -> Result<()> {
        self.sent.lock().unwrap().push((title.to_string(), level));
        Ok(())
    }
}

pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub source: Arc<SnapshotSource>,
    pub updater: Arc<RecordingUpdater>,
    pub notifier: Arc<RecordingNotifier>,
    pub store: Arc<MemoryFundingStore>,
    pub classifier: Arc<IntervalClassifier>,
    pub engine: SchedulerEngine,
    pub instruments: Vec<String>,
}

/// Three 8h instruments (next settlement 08:00) and two 4h instruments
/// (next settlement 04:00), clock at 01:30 on 2024-06-01
pub fn five_instruments() -> Harness {
    let clock = Arc::new(ManualClock::new(at(1, 1, 30, 0)));
    let entries = [
        ("AUSDT", at(1, 8, 0, 0)),
        ("BUSDT", at(1, 8, 0, 0)),
        ("CUSDT", at(1, 8, 0, 0)),
        ("DUSDT", at(1, 4, 0, 0)),
        ("EUSDT", at(1, 4, 0, 0)),
    ];
    let instruments = entries.iter().map(|(s, _)| s.to_string()).collect();
    harness(clock, SnapshotSource::with(&entries), instruments)
}

pub fn harness(clock: Arc<ManualClock>, source: SnapshotSource, instruments: Vec<String>) -> Harness {
    let source = Arc::new(source);
    let store = Arc::new(MemoryFundingStore::new());
    let notifier = Arc::new(RecordingNotifier::default());

    let fetcher = Arc::new(RateLimitedFetcher::new(
        source.clone(),
        clock.clone(),
        FetcherConfig::default(),
        Arc::new(MemoryStore::<StartTimeCache>::new()),
    ));
    let classifier = Arc::new(IntervalClassifier::new(
        fetcher,
        clock.clone(),
        Arc::new(MemoryStore::<ClassificationCache>::new()),
    ));
    let updater = Arc::new(RecordingUpdater {
        store: store.clone(),
        clock: clock.clone(),
        failing: Mutex::new(HashSet::new()),
        panic_next: AtomicBool::new(false),
        calls: Mutex::new(Vec::new()),
    });
    let runner = Arc::new(BatchExtractionRunner::new(
        updater.clone(),
        ExtractionConfig {
            error_pause_hourly_ms: 0,
            error_pause_default_ms: 0,
            ..ExtractionConfig::default()
        },
    ));
    let verifier = Arc::new(FreshnessVerifier::new(
        store.clone(),
        clock.clone(),
        ChronoDuration::minutes(5),
    ));
    let alerts = Arc::new(
        AlertManager::new(AlertPolicyConfig::default(), clock.clone())
            .with_notifier(notifier.clone()),
    );

    let engine = SchedulerEngine::new(SchedulerComponents {
        classifier: classifier.clone(),
        runner,
        verifier,
        alerts,
        policy: AlertPolicy::default(),
        clock: clock.clone(),
        config: SchedulerConfig {
            poll_interval_secs: 60,
            error_backoff_secs: 300,
            join_timeout_secs: 5,
            ..SchedulerConfig::default()
        },
    });

    Harness {
        clock,
        source,
        updater,
        notifier,
        store,
        classifier,
        engine,
        instruments,
    }
}

impl Harness {
    /// Start and let the loop finish its first tick before the clock moves
    pub async fn start(&self) {
        self.engine.start(&self.instruments).await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
}
