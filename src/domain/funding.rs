use chrono::{DateTime, Timelike, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One historical settlement (funding) event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingRecord {
    pub symbol: String,
    /// Settlement time, milliseconds since epoch
    pub funding_time: i64,
    pub funding_rate: Decimal,
    pub mark_price: Decimal,
}

impl FundingRecord {
    pub fn funding_datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.funding_time)
    }
}

/// Current state of one instrument from the premium index snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PremiumIndex {
    pub symbol: String,
    pub mark_price: Decimal,
    pub index_price: Decimal,
    pub last_funding_rate: Decimal,
    /// Next settlement, milliseconds since epoch (0 when unknown)
    pub next_funding_time: i64,
    /// Snapshot time, milliseconds since epoch
    pub time: i64,
}

impl PremiumIndex {
    /// UTC hour-of-day of the next settlement, if the source reported one
    pub fn next_settlement_hour(&self) -> Option<u32> {
        if self.next_funding_time <= 0 {
            return None;
        }
        DateTime::from_timestamp_millis(self.next_funding_time).map(|dt| dt.hour())
    }
}

/// Latest-value state per instrument, upserted by symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeState {
    pub symbol: String,
    pub mark_price: Decimal,
    pub index_price: Decimal,
    pub funding_rate: Decimal,
    pub next_funding_time: i64,
    pub event_time: i64,
}

impl RealtimeState {
    pub fn event_datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.event_time)
    }
}

impl From<&PremiumIndex> for RealtimeState {
    fn from(index: &PremiumIndex) -> Self {
        Self {
            symbol: index.symbol.clone(),
            mark_price: index.mark_price,
            index_price: index.index_price,
            funding_rate: index.last_funding_rate,
            next_funding_time: index.next_funding_time,
            event_time: index.time,
        }
    }
}

/// 24h ticker volume entry, used to rank instruments
#[derive(Debug, Clone, PartialEq)]
pub struct TickerVolume {
    pub symbol: String,
    pub quote_volume: Decimal,
}
