//! Domain model: the entities the collector fetches, persists and schedules.
//!
//! `Symbol` is the logical parent of every time-series row; `PriceSample`,
//! `Fundamentals` and `HistoryBar` are the three shapes of quote data a fetch
//! can return for a symbol; `RateLimitEvent` tracks throttling observed while
//! fetching; `Job` is the audit row backing one queue message.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

/// The kind of instrument a symbol represents. Affects which fields a fetch
/// is expected to populate (e.g. crypto has no `pe_ratio`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "asset_type", rename_all = "snake_case")]
pub enum AssetType {
    #[default]
    Equity,
    Fund,
    Crypto,
}

/// A tracked instrument. The logical parent of every price/fundamentals/
/// history row for this ticker; unique on `symbol`.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct Symbol {
    pub id: i32,
    pub symbol: String,
    pub asset_type: AssetType,
    pub currency: String,
    pub created_at: DateTime<Utc>,
}

/// One append-only price observation. Prices are truncated (not rounded) to
/// four decimal places before being stored; a missing volume is `NULL`, never
/// zero, since zero volume is itself a meaningful observation.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct PriceSample {
    pub id: i64,
    pub symbol_id: i32,
    pub price: Decimal,
    pub volume: Option<i64>,
    pub observed_at: DateTime<Utc>,
}

/// Fundamentals collected alongside a price sample. Every field is optional
/// because not every provider response, and not every asset type, carries
/// all of them (crypto has no P/E ratio).
#[derive(FromRow, Debug, Clone, Serialize, Deserialize, Default)]
pub struct Fundamentals {
    pub id: i64,
    pub symbol_id: i32,
    pub pe_ratio: Option<Decimal>,
    pub eps: Option<Decimal>,
    pub dividend_yield: Option<Decimal>,
    pub market_cap: Option<Decimal>,
    pub collected_at: DateTime<Utc>,
}

/// One daily OHLCV bar. Unique on `(symbol_id, bar_date)`; a second fetch for
/// the same day is a silent no-op rather than a duplicate row or an error.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct HistoryBar {
    pub id: i64,
    pub symbol_id: i32,
    pub bar_date: NaiveDate,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Option<i64>,
}

/// Status of a rate-limit window observed while fetching a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "rate_limit_status", rename_all = "snake_case")]
pub enum RateLimitStatus {
    #[default]
    Active,
    Resolved,
}

/// A single open-to-close window during which the quote source was throttling
/// requests for a symbol (or, with `symbol_id: None`, globally). At most one
/// `Active` event may exist per symbol at a time; `close` is idempotent.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitEvent {
    pub id: i64,
    pub symbol_id: Option<i32>,
    pub blocked_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub retry_count: i32,
    pub status: RateLimitStatus,
}

/// Everything a fetch for one symbol can produce in a single run. Not every
/// field need be present: a provider may return a price without
/// fundamentals, or without a history bar for the current day.
#[derive(Debug, Clone)]
pub struct QuoteRecord {
    pub symbol: String,
    pub asset_type: AssetType,
    pub currency: String,
    pub price: Option<PriceQuote>,
    pub fundamentals: Option<FundamentalsQuote>,
    pub history: Vec<HistoryQuote>,
}

#[derive(Debug, Clone)]
pub struct PriceQuote {
    pub price: Decimal,
    pub volume: Option<i64>,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct FundamentalsQuote {
    pub pe_ratio: Option<Decimal>,
    pub eps: Option<Decimal>,
    pub dividend_yield: Option<Decimal>,
    pub market_cap: Option<Decimal>,
    pub collected_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct HistoryQuote {
    pub bar_date: NaiveDate,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Option<i64>,
}

/// Lifecycle status of a collection job. Unlike the richer state machine this
/// crate was grounded on (which also tracked priority, overlap and misfire
/// policy for a general-purpose job table) a collection run is a single daily
/// job with no overlap concerns, so the status set is kept to the four states
/// the scheduler actually drives through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Success,
    Failed,
}

impl JobStatus {
    /// A job in a terminal state (`Success` or `Failed` with no retries left)
    /// never transitions again; callers relying on this invariant should
    /// check `JobStatus::is_terminal` before attempting to advance a job.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failed)
    }
}

/// The audit row backing one `ticker_updates` queue message. `symbols` holds
/// the ordered list of tickers this run should fetch; `scheduled_at` is the
/// wall-clock time (in the configured zone) the run was due.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Job {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,

    #[builder(default)]
    pub symbols: sqlx::types::Json<Vec<String>>,

    pub scheduled_at: DateTime<Utc>,

    #[builder(default)]
    pub retry_count: i32,

    #[builder(default)]
    pub status: JobStatus,

    #[builder(default, setter(strip_option))]
    pub last_attempted_at: Option<DateTime<Utc>>,

    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,

    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// `true` once `retry_count` has reached `max_retries`; the scheduler
    /// dead-letters the message instead of nacking it for redelivery.
    pub fn retries_exhausted(&self, max_retries: i32) -> bool {
        self.retry_count >= max_retries
    }
}
