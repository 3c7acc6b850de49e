pub mod adapters;
pub mod cli;
pub mod clock;
pub mod collector;
pub mod config;
pub mod domain;
pub mod error;
pub mod persistence;
pub mod scheduler;
pub mod services;
pub mod supervisor;

pub use clock::{Clock, ManualClock, SystemClock};
pub use collector::{
    BatchExtractionRunner, BatchUpdater, FundingUpdater, IntervalClassifier, MarketDataSource,
    RateLimitedFetcher,
};
pub use config::AppConfig;
pub use domain::{BatchResult, Cadence, FundingRecord, RealtimeState, VerificationResult};
pub use error::{FundwatchError, Result};
pub use persistence::{CacheStore, FundingStore, JsonFileStore, MemoryFundingStore, MemoryStore};
pub use scheduler::{SchedulerComponents, SchedulerEngine, SchedulerStatus};
pub use services::{HealthServer, HealthState, HistorySyncService};
pub use supervisor::{
    Alert, AlertLevel, AlertManager, AlertPolicy, FreshnessVerifier, Notifier,
};
