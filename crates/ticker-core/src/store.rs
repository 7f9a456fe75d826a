//! Persistence layer: turns a batch of fetched `QuoteRecord`s into rows,
//! one transaction per record so a failure on one symbol never rolls back
//! another.

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::PgPool;
use tracing::warn;

use crate::domain::QuoteRecord;

/// Persists fetched quote data. The fetch engine depends only on this trait;
/// `PostgresStore` is the shipped implementation.
#[async_trait]
pub trait Store: Send + Sync {
    /// Persist every record independently. Returns the count of records
    /// saved and the list of symbols whose transaction failed (callers
    /// should treat these the same as a per-symbol fetch failure: logged
    /// and counted, never aborting the rest of the run).
    async fn save_all(&self, records: Vec<QuoteRecord>) -> (usize, Vec<String>);
}

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn save_one(&self, record: &QuoteRecord) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;

        let symbol_id: i32 = sqlx::query_scalar(
            r#"
            INSERT INTO symbols (symbol, asset_type, currency)
            VALUES ($1, $2, $3)
            ON CONFLICT (symbol) DO UPDATE SET asset_type = EXCLUDED.asset_type
            RETURNING id
            "#,
        )
        .bind(&record.symbol)
        .bind(record.asset_type)
        .bind(&record.currency)
        .fetch_one(&mut *tx)
        .await?;

        if let Some(price) = &record.price {
            sqlx::query(
                r#"
                INSERT INTO price_samples (symbol_id, price, volume, observed_at)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(symbol_id)
            .bind(truncate4(price.price))
            .bind(price.volume)
            .bind(price.observed_at)
            .execute(&mut *tx)
            .await?;
        }

        if let Some(f) = &record.fundamentals {
            sqlx::query(
                r#"
                INSERT INTO fundamentals (symbol_id, pe_ratio, eps, dividend_yield, market_cap, collected_at)
                VALUES ($1, $2, $3, $4, $5, COALESCE($6, NOW()))
                "#,
            )
            .bind(symbol_id)
            .bind(f.pe_ratio.map(truncate4))
            .bind(f.eps.map(truncate4))
            .bind(f.dividend_yield.map(truncate4))
            .bind(f.market_cap.map(truncate4))
            .bind(f.collected_at)
            .execute(&mut *tx)
            .await?;
        }

        for bar in &record.history {
            sqlx::query(
                r#"
                INSERT INTO history_bars (symbol_id, bar_date, open, high, low, close, volume)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (symbol_id, bar_date) DO NOTHING
                "#,
            )
            .bind(symbol_id)
            .bind(bar.bar_date)
            .bind(truncate4(bar.open))
            .bind(truncate4(bar.high))
            .bind(truncate4(bar.low))
            .bind(truncate4(bar.close))
            .bind(bar.volume)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

/// Truncate (never round) to four decimal places, matching the `DECIMAL(12,4)`
/// column precision.
fn truncate4(value: Decimal) -> Decimal {
    value.trunc_with_scale(4)
}

#[async_trait]
impl Store for PostgresStore {
    async fn save_all(&self, records: Vec<QuoteRecord>) -> (usize, Vec<String>) {
        let mut saved = 0;
        let mut failed = Vec::new();

        for record in &records {
            match self.save_one(record).await {
                Ok(()) => saved += 1,
                Err(e) => {
                    warn!(symbol = %record.symbol, error = %e, "failed to persist record");
                    failed.push(record.symbol.clone());
                }
            }
        }

        (saved, failed)
    }
}
