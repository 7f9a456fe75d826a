//! The `QuoteSource` seam: everything the fetch engine knows about an
//! external market-data provider.

use async_trait::async_trait;

use crate::domain::QuoteRecord;
use crate::error::{CollectorError, FetchOutcome};

/// A provider of market data. The fetch engine depends only on this trait;
/// the concrete HTTP-backed adapter lives in `ticker-worker` so this crate
/// stays free of any particular provider's wire format.
#[async_trait]
pub trait QuoteSource: Send + Sync {
    /// Fetch one batch of symbols. Returns one outcome per symbol, in the
    /// same order as `symbols`, so the caller never has to re-correlate
    /// results by ticker. Per-symbol problems (throttling, a transient
    /// provider error, an unknown ticker) are reported through `FetchOutcome`
    /// and never surface as an `Err` here; `Err` is reserved for a
    /// catastrophic or configuration-class failure affecting the whole
    /// batch (e.g. the provider rejects the configured credentials), which
    /// the fetch engine propagates rather than retries.
    async fn fetch_batch(
        &self,
        symbols: &[String],
    ) -> Result<Vec<FetchOutcome<QuoteRecord>>, CollectorError>;

    /// Cheap reachability check for the health probe. Defaults to `true` so
    /// fakes used in tests don't need to implement it.
    async fn health_check(&self) -> bool {
        true
    }
}
