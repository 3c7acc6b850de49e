//! Binance USD-M futures REST client
//!
//! Covers the three public endpoints the tracker needs: the premium index
//! snapshot (mark/index price and next funding time for every instrument),
//! funding rate history, and 24h tickers for volume ranking.

use async_trait::async_trait;
use reqwest::StatusCode;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::collector::MarketDataSource;
use crate::domain::{FundingRecord, PremiumIndex, TickerVolume};
use crate::error::{FundwatchError, Result};

pub const BINANCE_FUTURES_URL: &str = "https://fapi.binance.com";

/// Hard limit of the funding rate endpoint
pub const MAX_HISTORY_LIMIT: usize = 1000;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFundingRate {
    symbol: String,
    funding_time: i64,
    funding_rate: String,
    /// Empty string on old records
    #[serde(default)]
    mark_price: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPremiumIndex {
    symbol: String,
    mark_price: String,
    index_price: String,
    #[serde(default)]
    last_funding_rate: Option<String>,
    #[serde(default)]
    next_funding_time: i64,
    time: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTicker {
    symbol: String,
    quote_volume: String,
}

/// Empty or missing numeric strings are treated as zero
fn parse_decimal(raw: Option<&str>) -> std::result::Result<Decimal, rust_decimal::Error> {
    match raw.map(str::trim) {
        None | Some("") => Ok(Decimal::ZERO),
        Some(value) => Decimal::from_str(value),
    }
}

impl RawFundingRate {
    fn into_record(self) -> Option<FundingRecord> {
        let funding_rate = parse_decimal(Some(&self.funding_rate)).ok()?;
        let mark_price = parse_decimal(self.mark_price.as_deref()).ok()?;
        Some(FundingRecord {
            symbol: self.symbol,
            funding_time: self.funding_time,
            funding_rate,
            mark_price,
        })
    }
}

impl RawPremiumIndex {
    fn into_index(self) -> Option<PremiumIndex> {
        Some(PremiumIndex {
            mark_price: parse_decimal(Some(&self.mark_price)).ok()?,
            index_price: parse_decimal(Some(&self.index_price)).ok()?,
            last_funding_rate: parse_decimal(self.last_funding_rate.as_deref()).ok()?,
            next_funding_time: self.next_funding_time,
            time: self.time,
            symbol: self.symbol,
        })
    }
}

/// Unauthenticated REST client, one request per trait call
pub struct BinanceFuturesClient {
    client: reqwest::Client,
    base_url: String,
}

impl BinanceFuturesClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
        context: &str,
    ) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        debug!("GET {} {:?}", url, query);

        let response = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| FundwatchError::Network(format!("{} request failed: {}", context, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(map_status(status, context));
        }

        response
            .json()
            .await
            .map_err(|e| FundwatchError::Network(format!("{} parse error: {}", context, e)))
    }
}

fn map_status(status: StatusCode, context: &str) -> FundwatchError {
    match status {
        StatusCode::FORBIDDEN => FundwatchError::Forbidden(context.to_string()),
        StatusCode::TOO_MANY_REQUESTS => FundwatchError::RateLimited(context.to_string()),
        other => FundwatchError::Network(format!("{} API error: {}", context, other)),
    }
}

#[async_trait]
impl MarketDataSource for BinanceFuturesClient {
    #[instrument(skip(self))]
    async fn premium_index(&self) -> Result<Vec<PremiumIndex>> {
        let raw: Vec<RawPremiumIndex> = self
            .get_json("/fapi/v1/premiumIndex", &[], "premiumIndex")
            .await?;

        let total = raw.len();
        let indices: Vec<PremiumIndex> = raw.into_iter().filter_map(|r| r.into_index()).collect();
        if indices.len() < total {
            warn!(
                "Dropped {} unparseable premium index rows",
                total - indices.len()
            );
        }
        debug!("Fetched premium index for {} instruments", indices.len());
        Ok(indices)
    }

    #[instrument(skip(self))]
    async fn funding_history(
        &self,
        symbol: &str,
        start_time: Option<i64>,
        end_time: Option<i64>,
        limit: usize,
    ) -> Result<Vec<FundingRecord>> {
        let mut query = vec![
            ("symbol", symbol.to_string()),
            ("limit", limit.clamp(1, MAX_HISTORY_LIMIT).to_string()),
        ];
        if let Some(start) = start_time {
            query.push(("startTime", start.to_string()));
        }
        if let Some(end) = end_time {
            query.push(("endTime", end.to_string()));
        }

        let raw: Vec<RawFundingRate> = self
            .get_json("/fapi/v1/fundingRate", &query, symbol)
            .await?;

        let records: Vec<FundingRecord> = raw
            .into_iter()
            .filter_map(|r| {
                let time = r.funding_time;
                let record = r.into_record();
                if record.is_none() {
                    warn!("Skipping invalid funding record for {} at {}", symbol, time);
                }
                record
            })
            .collect();

        debug!("Retrieved {} funding records for {}", records.len(), symbol);
        Ok(records)
    }

    #[instrument(skip(self))]
    async fn ticker_24h(&self) -> Result<Vec<TickerVolume>> {
        let raw: Vec<RawTicker> = self
            .get_json("/fapi/v1/ticker/24hr", &[], "ticker/24hr")
            .await?;

        Ok(raw
            .into_iter()
            .filter_map(|t| {
                Some(TickerVolume {
                    quote_volume: parse_decimal(Some(&t.quote_volume)).ok()?,
                    symbol: t.symbol,
                })
            })
            .collect())
    }
}
