//! # ticker-core
//!
//! Domain model, persistence, rate-limit tracking and configuration for the
//! ticker collector. Framework- and broker-agnostic: this crate knows
//! nothing about AMQP or HTTP, only about symbols, prices, fundamentals,
//! history bars and the traits (`QuoteSource`, `Store`, `RateLimitTracker`)
//! that the worker binary wires up to concrete implementations.
//!
//! ## Layout
//!
//! - [`domain`] - the entities: `Symbol`, `PriceSample`, `Fundamentals`,
//!   `HistoryBar`, `RateLimitEvent`, `Job`.
//! - [`error`] - the five-kind error taxonomy and the explicit `FetchOutcome`
//!   result type fetches are reported through.
//! - [`config`] - the immutable `Settings` snapshot loaded once at startup.
//! - [`quote_source`] - the `QuoteSource` trait.
//! - [`store`] - the `Store` trait and its `PostgresStore` implementation.
//! - [`job_store`] - the `JobStore` trait tracking the audit `Job` row's
//!   `Pending -> Running -> Success|Failed` lifecycle.
//! - [`rate_limit`] - the `RateLimitTracker` trait and its Postgres
//!   implementation.
//! - [`business_day`] - the pluggable `BusinessDayCalendar` trait.

pub mod business_day;
pub mod config;
pub mod domain;
pub mod error;
pub mod job_store;
pub mod quote_source;
pub mod rate_limit;
pub mod store;

pub use business_day::{BusinessDayCalendar, WeekdayCalendar};
pub use config::{LogFormat, Settings};
pub use domain::{
    AssetType, Fundamentals, FundamentalsQuote, HistoryBar, HistoryQuote, Job, JobStatus,
    PriceQuote, PriceSample, QuoteRecord, RateLimitEvent, RateLimitStatus, Symbol,
};
pub use error::{CollectorError, FetchOutcome};
pub use job_store::{JobStore, PostgresJobStore};
pub use quote_source::QuoteSource;
pub use rate_limit::{PostgresRateLimitTracker, RateLimitStats, RateLimitTracker};
pub use store::{PostgresStore, Store};
