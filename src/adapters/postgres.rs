use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use std::collections::HashMap;
use tracing::{debug, info, instrument};

use crate::domain::{FundingRecord, RealtimeState};
use crate::error::Result;
use crate::persistence::FundingStore;

/// Rows per multi-value INSERT
const UPSERT_CHUNK: usize = 1000;

/// PostgreSQL funding store
#[derive(Clone)]
pub struct PostgresFundingStore {
    pool: PgPool,
}

impl PostgresFundingStore {
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables and indexes if missing
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS funding_history (
                symbol TEXT NOT NULL,
                funding_time BIGINT NOT NULL,
                funding_rate NUMERIC(20,10) NOT NULL,
                mark_price NUMERIC(30,10) NOT NULL DEFAULT 0,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (symbol, funding_time)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_funding_history_time ON funding_history(funding_time DESC)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS funding_realtime (
                symbol TEXT PRIMARY KEY,
                mark_price NUMERIC(30,10) NOT NULL,
                index_price NUMERIC(30,10) NOT NULL,
                funding_rate NUMERIC(20,10) NOT NULL,
                next_funding_time BIGINT NOT NULL,
                event_time BIGINT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Funding schema ready");
        Ok(())
    }
}

#[async_trait]
impl FundingStore for PostgresFundingStore {
    #[instrument(skip(self, records), fields(count = records.len()))]
    async fn upsert_history(&self, records: &[FundingRecord]) -> Result<usize> {
        let mut written = 0usize;
        for chunk in records.chunks(UPSERT_CHUNK) {
            let mut qb: sqlx::QueryBuilder<sqlx::Postgres> = sqlx::QueryBuilder::new(
                "INSERT INTO funding_history (symbol, funding_time, funding_rate, mark_price) ",
            );
            qb.push_values(chunk.iter(), |mut b, r| {
                b.push_bind(&r.symbol)
                    .push_bind(r.funding_time)
                    .push_bind(r.funding_rate)
                    .push_bind(r.mark_price);
            });
            qb.push(
                r#"
                ON CONFLICT (symbol, funding_time) DO UPDATE SET
                    funding_rate = EXCLUDED.funding_rate,
                    mark_price = EXCLUDED.mark_price
                "#,
            );

            let result = qb.build().execute(&self.pool).await?;
            written += result.rows_affected() as usize;
        }
        debug!("Upserted {} funding history rows", written);
        Ok(written)
    }

    #[instrument(skip(self, states), fields(count = states.len()))]
    async fn upsert_realtime(&self, states: &[RealtimeState]) -> Result<usize> {
        if states.is_empty() {
            return Ok(0);
        }

        let mut qb: sqlx::QueryBuilder<sqlx::Postgres> = sqlx::QueryBuilder::new(
            r#"
            INSERT INTO funding_realtime (
                symbol, mark_price, index_price, funding_rate, next_funding_time, event_time
            )
            "#,
        );
        qb.push_values(states.iter(), |mut b, s| {
            b.push_bind(&s.symbol)
                .push_bind(s.mark_price)
                .push_bind(s.index_price)
                .push_bind(s.funding_rate)
                .push_bind(s.next_funding_time)
                .push_bind(s.event_time);
        });
        qb.push(
            r#"
            ON CONFLICT (symbol) DO UPDATE SET
                mark_price = EXCLUDED.mark_price,
                index_price = EXCLUDED.index_price,
                funding_rate = EXCLUDED.funding_rate,
                next_funding_time = EXCLUDED.next_funding_time,
                event_time = EXCLUDED.event_time,
                updated_at = NOW()
            "#,
        );

        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected() as usize)
    }

    #[instrument(skip(self))]
    async fn latest_settlement_time(&self, symbol: &str) -> Result<Option<i64>> {
        let row = sqlx::query(
            "SELECT MAX(funding_time) AS latest FROM funding_history WHERE symbol = $1",
        )
        .bind(symbol)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get::<Option<i64>, _>("latest"))
    }

    #[instrument(skip(self, symbols), fields(count = symbols.len()))]
    async fn latest_realtime_updates(
        &self,
        symbols: &[String],
    ) -> Result<HashMap<String, DateTime<Utc>>> {
        let rows = sqlx::query(
            "SELECT symbol, event_time FROM funding_realtime WHERE symbol = ANY($1)",
        )
        .bind(symbols)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .filter_map(|r| {
                let symbol: String = r.get("symbol");
                let event_time: i64 = r.get("event_time");
                DateTime::from_timestamp_millis(event_time).map(|ts| (symbol, ts))
            })
            .collect())
    }
}
