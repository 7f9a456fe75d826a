//! Rate-limit tracker: records throttling windows observed while fetching.
//!
//! At most one `Active` event exists per symbol at a time. `close` is
//! idempotent so a fetch engine that observed a symbol recover can always
//! call it without first checking whether it already closed the event.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::domain::RateLimitEvent;

#[async_trait]
pub trait RateLimitTracker: Send + Sync {
    /// Open a new `Active` rate-limit event for `symbol` (or, with
    /// `symbol = None`, a provider-wide event), stamped with the retry
    /// attempt that observed the throttle. Called the first time a fetch
    /// attempt for this symbol within a run observes throttling; the caller
    /// must close any existing `Active` event for the symbol first.
    async fn open(&self, symbol: Option<&str>, retry_count: i32) -> Result<RateLimitEvent>;

    /// Close the most recent `Active` event for `symbol`, stamping
    /// `resolved_at` and `duration_seconds`. A no-op if no `Active` event
    /// exists.
    async fn close(&self, symbol: Option<&str>) -> Result<()>;

    /// Whether `symbol` currently has an `Active` rate-limit event.
    async fn active(&self, symbol: Option<&str>) -> Result<bool>;

    /// Historical rate-limit stats for `symbol`: totals, resolved/active
    /// split, duration aggregates, most recent block, and peak retry count.
    async fn stats(&self, symbol: &str) -> Result<RateLimitStats>;
}

#[derive(Debug, Clone, Default)]
pub struct RateLimitStats {
    pub total_events: i64,
    pub resolved_count: i64,
    pub active_count: i64,
    pub avg_duration_seconds: Option<f64>,
    pub max_duration_seconds: Option<i64>,
    pub most_recent_blocked_at: Option<DateTime<Utc>>,
    pub peak_retry_count: i32,
}

pub struct PostgresRateLimitTracker {
    pool: PgPool,
}

impl PostgresRateLimitTracker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Resolve `symbol` to its surrogate id, creating the `Symbol` row (with
    /// default asset type/currency) if a throttle is observed before the
    /// fetch engine ever persists a successful quote for it. Without this, a
    /// never-before-seen symbol would resolve to `symbol_id = NULL`, which is
    /// reserved for a genuinely batch-wide event (§3) — collapsing every
    /// unknown symbol's rate-limit events onto the same NULL bucket and
    /// letting `close` resolve an unrelated symbol's event. Used only by
    /// `open`, the one place a new event row is actually created.
    async fn upsert_symbol_id(&self, symbol: &str) -> Result<i32> {
        let (id,): (i32,) = sqlx::query_as(
            r#"
            INSERT INTO symbols (symbol)
            VALUES ($1)
            ON CONFLICT (symbol) DO UPDATE SET symbol = EXCLUDED.symbol
            RETURNING id
            "#,
        )
        .bind(symbol)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    /// Read-only lookup for `close`/`active`/`stats`, which should never
    /// conjure a `Symbol` row into existence just to check state.
    async fn find_symbol_id(&self, symbol: &str) -> Result<Option<i32>> {
        let id: Option<(i32,)> = sqlx::query_as("SELECT id FROM symbols WHERE symbol = $1")
            .bind(symbol)
            .fetch_optional(&self.pool)
            .await?;
        Ok(id.map(|(id,)| id))
    }
}

#[async_trait]
impl RateLimitTracker for PostgresRateLimitTracker {
    async fn open(&self, symbol: Option<&str>, retry_count: i32) -> Result<RateLimitEvent> {
        let symbol_id = match symbol {
            Some(s) => Some(self.upsert_symbol_id(s).await?),
            None => None,
        };

        let event = sqlx::query_as::<_, RateLimitEvent>(
            r#"
            INSERT INTO rate_limit_events (symbol_id, blocked_at, retry_count, status)
            VALUES ($1, NOW(), $2, 'active')
            RETURNING id, symbol_id, blocked_at, resolved_at, duration_seconds, retry_count, status
            "#,
        )
        .bind(symbol_id)
        .bind(retry_count)
        .fetch_one(&self.pool)
        .await?;

        Ok(event)
    }

    async fn close(&self, symbol: Option<&str>) -> Result<()> {
        let symbol_id = match symbol {
            Some(s) => self.find_symbol_id(s).await?,
            None => None,
        };

        sqlx::query(
            r#"
            UPDATE rate_limit_events
            SET resolved_at = NOW(),
                duration_seconds = EXTRACT(EPOCH FROM (NOW() - blocked_at))::BIGINT,
                status = 'resolved'
            WHERE status = 'active'
              AND symbol_id IS NOT DISTINCT FROM $1
            "#,
        )
        .bind(symbol_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn active(&self, symbol: Option<&str>) -> Result<bool> {
        let symbol_id = match symbol {
            Some(s) => self.find_symbol_id(s).await?,
            None => None,
        };

        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT id FROM rate_limit_events
            WHERE status = 'active' AND symbol_id IS NOT DISTINCT FROM $1
            LIMIT 1
            "#,
        )
        .bind(symbol_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.is_some())
    }

    async fn stats(&self, symbol: &str) -> Result<RateLimitStats> {
        let symbol_id = self.find_symbol_id(symbol).await?;

        #[allow(clippy::type_complexity)]
        let row: (
            i64,
            i64,
            i64,
            Option<f64>,
            Option<i64>,
            Option<DateTime<Utc>>,
            Option<i32>,
        ) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*),
                COUNT(*) FILTER (WHERE status = 'resolved'),
                COUNT(*) FILTER (WHERE status = 'active'),
                AVG(duration_seconds)::FLOAT8,
                MAX(duration_seconds),
                MAX(blocked_at),
                MAX(retry_count)
            FROM rate_limit_events
            WHERE symbol_id = $1
            "#,
        )
        .bind(symbol_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(RateLimitStats {
            total_events: row.0,
            resolved_count: row.1,
            active_count: row.2,
            avg_duration_seconds: row.3,
            max_duration_seconds: row.4,
            most_recent_blocked_at: row.5,
            peak_retry_count: row.6.unwrap_or(0),
        })
    }
}
