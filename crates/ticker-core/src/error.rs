//! Error taxonomy for the ticker collector.
//!
//! `CollectorError` is the structured error type that crosses component
//! boundaries (quote source, persistence, rate-limit tracker). Each variant
//! corresponds to one of the five failure kinds the fetch engine and
//! scheduler branch on. `FetchOutcome` is the explicit, non-exception result
//! of fetching one batch of symbols, used so retry/backoff decisions read off
//! a type instead of matching on driver-specific error strings.

use thiserror::Error;

/// The five-kind error taxonomy used throughout the collector.
///
/// Anything that crosses a component boundary (quote source -> fetch engine,
/// fetch engine -> scheduler) is represented as one of these variants rather
/// than a bare `anyhow::Error`, so retry and dead-letter decisions can match
/// on `kind()` instead of inspecting error text.
#[derive(Debug, Error)]
pub enum CollectorError {
    /// Missing or unparseable configuration. Fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Infrastructure failure expected to self-resolve: connection reset,
    /// timeout, 5xx. Safe to retry with backoff.
    #[error("transient error: {0}")]
    Transient(String),

    /// The quote source signaled a rate limit (429 or provider-specific
    /// throttle response). Distinct from `Transient` because it feeds the
    /// rate-limit tracker rather than a blind retry.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// A single symbol could not be collected for a reason that retrying the
    /// same request will not fix (unknown ticker, malformed payload for this
    /// symbol only). The batch continues; this symbol is recorded as failed.
    #[error("per-symbol data error for {symbol}: {reason}")]
    PerSymbolData { symbol: String, reason: String },

    /// A failure serious enough that the whole run should stop rather than
    /// retry: database unreachable, broker connection lost, disk full.
    #[error("catastrophic error: {0}")]
    Catastrophic(String),
}

impl CollectorError {
    /// Returns true if this error kind warrants an automatic retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CollectorError::Transient(_) | CollectorError::RateLimited(_)
        )
    }
}

/// The outcome of fetching one symbol (or one batch) from a `QuoteSource`.
///
/// Kept as an explicit enum rather than `Result<Quote, CollectorError>` so
/// the fetch engine's batch loop can match on all four cases without a
/// catch-all arm swallowing an unexpected variant.
#[derive(Debug, Clone)]
pub enum FetchOutcome<T> {
    /// The symbol was fetched successfully.
    Success(T),
    /// The quote source is throttling requests; back off and retry later,
    /// and record a rate-limit event for the symbol.
    Throttled,
    /// A transient failure occurred (timeout, connection reset, 5xx);
    /// retry with exponential backoff.
    Transient(String),
    /// This symbol cannot be fetched no matter how many times we retry
    /// (unknown ticker, provider says permanently invalid).
    Permanent(String),
}

impl<T> FetchOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, FetchOutcome::Success(_))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchOutcome::Throttled | FetchOutcome::Transient(_))
    }
}
