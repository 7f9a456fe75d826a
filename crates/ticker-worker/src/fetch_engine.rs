//! Fetch Engine: batches symbols, retries transient and rate-limited
//! failures with exponential backoff, and records per-symbol permanent
//! failures without aborting the run.

use std::sync::Arc;
use std::time::Duration;

use ticker_core::{CollectorError, FetchOutcome, QuoteRecord, QuoteSource, RateLimitTracker};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct FetchEngineConfig {
    pub batch_size: usize,
    pub inter_batch_delay: Duration,
    pub max_retries: u32,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
}

pub struct FetchEngine {
    quote_source: Arc<dyn QuoteSource>,
    rate_limit_tracker: Arc<dyn RateLimitTracker>,
    config: FetchEngineConfig,
}

/// Result of fetching a full symbol list. Never an `Err` for per-symbol
/// problems; only a genuinely catastrophic condition (loss of quote source
/// configuration) propagates as one.
pub struct FetchResult {
    pub successes: Vec<QuoteRecord>,
    pub permanent_failures: Vec<String>,
}

impl FetchEngine {
    pub fn new(
        quote_source: Arc<dyn QuoteSource>,
        rate_limit_tracker: Arc<dyn RateLimitTracker>,
        config: FetchEngineConfig,
    ) -> Self {
        Self {
            quote_source,
            rate_limit_tracker,
            config,
        }
    }

    /// `fetch(symbols) -> (successes, permanent_failures)`, partitioned into
    /// `batch_size`-sized chunks processed strictly in sequence, each
    /// separated by `inter_batch_delay`. All suspension points (inter-batch
    /// delay, retry backoff) respect `shutdown` so a graceful-shutdown
    /// signal aborts them immediately.
    pub async fn fetch(
        &self,
        symbols: &[String],
        shutdown: &CancellationToken,
    ) -> Result<FetchResult, CollectorError> {
        let mut successes = Vec::new();
        let mut permanent_failures = Vec::new();

        let chunks: Vec<&[String]> = symbols.chunks(self.config.batch_size).collect();

        for (i, batch) in chunks.iter().enumerate() {
            if shutdown.is_cancelled() {
                break;
            }

            let (batch_successes, batch_failures) =
                self.fetch_batch_with_retry(batch, shutdown).await?;
            successes.extend(batch_successes);
            permanent_failures.extend(batch_failures);

            let is_last = i + 1 == chunks.len();
            if !is_last {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.inter_batch_delay) => {}
                }
            }
        }

        Ok(FetchResult {
            successes,
            permanent_failures,
        })
    }

    /// Retry one batch through the quote source until it succeeds, every
    /// symbol in it is resolved as a permanent failure, or the retry ceiling
    /// is hit (in which case the whole batch is marked permanently failed).
    async fn fetch_batch_with_retry(
        &self,
        batch: &[String],
        shutdown: &CancellationToken,
    ) -> Result<(Vec<QuoteRecord>, Vec<String>), CollectorError> {
        let mut successes = Vec::new();
        let mut permanent_failures = Vec::new();
        let mut pending: Vec<String> = batch.to_vec();
        let mut attempt: u32 = 1;
        // Symbols with a currently-open ACTIVE rate-limit event for this run.
        // `open` is only called once per symbol (the tracker disallows a
        // second open while one is active); it is closed the moment the
        // symbol leaves the retry loop, whether by success or exhaustion.
        let mut throttled: std::collections::HashSet<String> = std::collections::HashSet::new();

        loop {
            if pending.is_empty() || shutdown.is_cancelled() {
                break;
            }

            let outcomes = self.quote_source.fetch_batch(&pending).await?;
            let mut retry_batch = Vec::new();
            let mut saw_retryable = false;

            for (symbol, outcome) in pending.iter().zip(outcomes.into_iter()) {
                match outcome {
                    FetchOutcome::Success(record) => {
                        if throttled.remove(symbol) {
                            let _ = self.rate_limit_tracker.close(Some(symbol)).await;
                        }
                        successes.push(record);
                    }
                    FetchOutcome::Throttled => {
                        saw_retryable = true;
                        if throttled.insert(symbol.clone()) {
                            if let Err(e) =
                                self.rate_limit_tracker.open(Some(symbol), attempt as i32).await
                            {
                                warn!(symbol = %symbol, error = %e, "failed to record rate-limit event");
                            }
                        }
                        retry_batch.push(symbol.clone());
                    }
                    FetchOutcome::Transient(reason) => {
                        warn!(symbol = %symbol, reason = %reason, "transient fetch failure");
                        saw_retryable = true;
                        retry_batch.push(symbol.clone());
                    }
                    FetchOutcome::Permanent(reason) => {
                        warn!(symbol = %symbol, reason = %reason, "permanent fetch failure");
                        permanent_failures.push(symbol.clone());
                    }
                }
            }

            if retry_batch.is_empty() {
                break;
            }

            if !saw_retryable || attempt as u64 >= self.config.max_retries as u64 {
                // Retry ceiling hit: every symbol still pending is a
                // permanent failure for this run. Their rate-limit events
                // (if any) are left ACTIVE; no sweeper resolves them.
                permanent_failures.extend(retry_batch.drain(..));
                break;
            }

            let delay_secs = self
                .config
                .backoff_base_secs
                .saturating_pow(attempt)
                .min(self.config.backoff_max_secs);

            info!(
                attempt,
                delay_secs,
                remaining = retry_batch.len(),
                "retrying batch after backoff"
            );

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_secs(delay_secs)) => {}
            }

            pending = retry_batch;
            attempt += 1;
        }

        Ok((successes, permanent_failures))
    }
}

/// Maps a `CollectorError` surfaced outside the batch loop (configuration
/// loss, broker/database outage) into the catastrophic case the fetch
/// engine's public contract says it will propagate rather than swallow.
pub fn is_catastrophic(error: &CollectorError) -> bool {
    matches!(error, CollectorError::Catastrophic(_) | CollectorError::Configuration(_))
}
