//! Persistence boundaries
//!
//! - Funding store for settlement history and realtime state
//! - Whole-document caches for classifications and start times

pub mod cache_store;
pub mod funding_store;

pub use cache_store::{CacheStore, JsonFileStore, MemoryStore};
pub use funding_store::{FundingStore, MemoryFundingStore};
