//! Settlement cadence classification
//!
//! Cadence is inferred from the UTC hour of each instrument's next settlement
//! in one premium index snapshot. Decisions are cached and persisted so that
//! known instruments never cost a request.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use super::fetcher::RateLimitedFetcher;
use crate::clock::Clock;
use crate::domain::{determine_cadence, Cadence};
use crate::persistence::CacheStore;

/// Decision log is trimmed to this many entries, oldest first
pub const MAX_DECISION_LOG: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionLogEntry {
    pub symbol: String,
    /// `None` when the snapshot carried no next settlement time
    pub next_settlement_hour: Option<u32>,
    pub cadence: Cadence,
    pub decided_at: DateTime<Utc>,
}

/// Persisted classification document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClassificationCache {
    #[serde(default)]
    pub intervals: BTreeMap<String, Cadence>,
    #[serde(default)]
    pub detection_history: VecDeque<DecisionLogEntry>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationStats {
    pub total: usize,
    pub per_cadence: BTreeMap<Cadence, usize>,
    pub last_updated: Option<DateTime<Utc>>,
    pub decision_log_len: usize,
}

impl ClassificationCache {
    fn record(&mut self, entry: DecisionLogEntry) {
        self.intervals.insert(entry.symbol.clone(), entry.cadence);
        self.detection_history.push_back(entry);
        while self.detection_history.len() > MAX_DECISION_LOG {
            self.detection_history.pop_front();
        }
    }

    pub fn stats(&self) -> ClassificationStats {
        let mut per_cadence: BTreeMap<Cadence, usize> =
            Cadence::ALL.iter().map(|c| (*c, 0)).collect();
        for cadence in self.intervals.values() {
            *per_cadence.entry(*cadence).or_default() += 1;
        }
        ClassificationStats {
            total: self.intervals.len(),
            per_cadence,
            last_updated: self.last_updated,
            decision_log_len: self.detection_history.len(),
        }
    }
}

/// Group a classification into per-cadence buckets, each sorted
pub fn group_by_cadence(classified: &BTreeMap<String, Cadence>) -> BTreeMap<Cadence, Vec<String>> {
    let mut buckets: BTreeMap<Cadence, Vec<String>> = BTreeMap::new();
    for (symbol, cadence) in classified {
        buckets.entry(*cadence).or_default().push(symbol.clone());
    }
    buckets
}

pub struct IntervalClassifier {
    fetcher: Arc<RateLimitedFetcher>,
    clock: Arc<dyn Clock>,
    store: Arc<dyn CacheStore<ClassificationCache>>,
    cache: RwLock<ClassificationCache>,
    persist: Mutex<()>,
}

impl IntervalClassifier {
    pub fn new(
        fetcher: Arc<RateLimitedFetcher>,
        clock: Arc<dyn Clock>,
        store: Arc<dyn CacheStore<ClassificationCache>>,
    ) -> Self {
        let cache = match store.load() {
            Ok(Some(cache)) => {
                info!("Loaded classification cache with {} instruments", cache.intervals.len());
                cache
            }
            Ok(None) => ClassificationCache::default(),
            Err(e) => {
                warn!("Failed to load classification cache, starting empty: {}", e);
                ClassificationCache::default()
            }
        };

        Self {
            fetcher,
            clock,
            store,
            cache: RwLock::new(cache),
            persist: Mutex::new(()),
        }
    }

    /// Cadence for every instrument given.
    ///
    /// Cached instruments are answered without a request. The rest share one
    /// snapshot; instruments absent from it, or the whole subset when the
    /// snapshot fails, default to 8h without being cached.
    pub async fn classify(&self, instruments: &[String]) -> BTreeMap<String, Cadence> {
        self.classify_inner(instruments, false).await
    }

    /// Re-derive every instrument from a fresh snapshot, ignoring the cache
    pub async fn refresh(&self, instruments: &[String]) -> BTreeMap<String, Cadence> {
        self.classify_inner(instruments, true).await
    }

    async fn classify_inner(
        &self,
        instruments: &[String],
        force: bool,
    ) -> BTreeMap<String, Cadence> {
        let mut result = BTreeMap::new();
        let mut pending = Vec::new();

        {
            let cache = self.cache.read().await;
            for symbol in instruments {
                match cache.intervals.get(symbol) {
                    Some(cadence) if !force => {
                        result.insert(symbol.clone(), *cadence);
                    }
                    _ => pending.push(symbol.clone()),
                }
            }
        }

        if pending.is_empty() {
            debug!("All {} instruments found in classification cache", result.len());
            return result;
        }

        info!("Classifying {} uncached instruments", pending.len());
        let snapshot = match self.fetcher.premium_index().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(
                    "Snapshot failed, defaulting {} instruments to 8h: {}",
                    pending.len(),
                    e
                );
                for symbol in pending {
                    result.insert(symbol, Cadence::EightHour);
                }
                return result;
            }
        };

        let by_symbol: HashMap<&str, _> = snapshot
            .iter()
            .map(|index| (index.symbol.as_str(), index))
            .collect();

        let now = self.clock.now();
        let mut decided = 0usize;
        let mut cache = self.cache.write().await;
        for symbol in pending {
            let Some(index) = by_symbol.get(symbol.as_str()) else {
                debug!("{} not in snapshot, defaulting to 8h", symbol);
                result.insert(symbol, Cadence::EightHour);
                continue;
            };

            let hour = index.next_settlement_hour();
            let cadence = hour.map(determine_cadence).unwrap_or(Cadence::EightHour);
            cache.record(DecisionLogEntry {
                symbol: symbol.clone(),
                next_settlement_hour: hour,
                cadence,
                decided_at: now,
            });
            result.insert(symbol, cadence);
            decided += 1;
        }

        if decided > 0 {
            cache.last_updated = Some(now);
            let snapshot = cache.clone();
            // Saves are queued in mutation order, the file write runs unlocked
            let _persist = self.persist.lock().await;
            drop(cache);
            if let Err(e) = self.store.save(&snapshot) {
                error!("Failed to persist classification cache: {}", e);
            }
        }

        info!("Classified {} instruments from snapshot", decided);
        result
    }

    pub async fn cached(&self, symbol: &str) -> Option<Cadence> {
        self.cache.read().await.intervals.get(symbol).copied()
    }

    pub async fn stats(&self) -> ClassificationStats {
        self.cache.read().await.stats()
    }

    pub async fn decision_log(&self) -> Vec<DecisionLogEntry> {
        self.cache
            .read()
            .await
            .detection_history
            .iter()
            .cloned()
            .collect()
    }
}
