use async_trait::async_trait;

use crate::domain::{FundingRecord, PremiumIndex, TickerVolume};
use crate::error::Result;

/// Raw market-data endpoints.
///
/// Implementations issue exactly one outbound request per call and map
/// HTTP 403 to `Forbidden`, 429 to `RateLimited` and anything else that
/// fails to `Network`. Pacing and blacklisting live in the fetcher.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Current state of every instrument, one call per snapshot
    async fn premium_index(&self) -> Result<Vec<PremiumIndex>>;

    /// Settlement records in ascending time order
    async fn funding_history(
        &self,
        symbol: &str,
        start_time: Option<i64>,
        end_time: Option<i64>,
        limit: usize,
    ) -> Result<Vec<FundingRecord>>;

    async fn ticker_24h(&self) -> Result<Vec<TickerVolume>>;
}
