//! Funding data collection
//!
//! Classifies instruments into settlement cadences, paces every request to
//! the market-data source through one global gate, and runs batched
//! extraction and first-time backfill on top of it.

mod classifier;
mod fetcher;
mod runner;
mod source;
mod updater;

#[cfg(test)]
pub(crate) mod test_support;

pub use classifier::{
    group_by_cadence, ClassificationCache, ClassificationStats, DecisionLogEntry,
    IntervalClassifier, MAX_DECISION_LOG,
};
pub use fetcher::{RateLimitedFetcher, StartTimeCache, SEED_BLACKLIST};
pub use runner::{BatchExtractionRunner, BatchUpdater};
pub use source::MarketDataSource;
pub use updater::FundingUpdater;
