//! HTTP-backed `QuoteSource` adapter. Maps a documented JSON envelope onto
//! the four-outcome `FetchOutcome` contract so the fetch engine never has to
//! inspect a `reqwest::Error` or a status code directly.
//!
//! The provider's actual wire format is out of scope (§1 of the
//! specification treats the HTTP client as an external collaborator); this
//! adapter exists so the seam is fully wired and testable behind a fake HTTP
//! layer, not as a real-provider integration.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::warn;

use ticker_core::{
    AssetType, CollectorError, FetchOutcome, FundamentalsQuote, HistoryQuote, PriceQuote,
    QuoteRecord, QuoteSource,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// The documented JSON envelope one `fetch_batch` call returns: one entry
/// per requested symbol, in request order.
#[derive(Debug, Deserialize)]
struct BatchResponse {
    quotes: Vec<QuoteEnvelope>,
}

#[derive(Debug, Deserialize)]
struct QuoteEnvelope {
    symbol: String,
    #[serde(default)]
    status: QuoteStatus,
    asset_type: Option<AssetType>,
    currency: Option<String>,
    price: Option<Decimal>,
    volume: Option<i64>,
    observed_at: Option<DateTime<Utc>>,
    pe_ratio: Option<Decimal>,
    eps: Option<Decimal>,
    dividend_yield: Option<Decimal>,
    market_cap: Option<Decimal>,
    #[serde(default)]
    history: Vec<HistoryBarEnvelope>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HistoryBarEnvelope {
    bar_date: NaiveDate,
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
    volume: Option<i64>,
}

#[derive(Debug, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
enum QuoteStatus {
    #[default]
    Ok,
    NotFound,
    Invalid,
}

pub struct HttpQuoteSource {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpQuoteSource {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            api_key,
        })
    }

    fn request(&self, symbols: &[String]) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .post(format!("{}/quotes/batch", self.base_url))
            .json(&serde_json::json!({ "symbols": symbols }));

        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        req
    }
}

#[async_trait]
impl QuoteSource for HttpQuoteSource {
    async fn fetch_batch(
        &self,
        symbols: &[String],
    ) -> Result<Vec<FetchOutcome<QuoteRecord>>, CollectorError> {
        let response = match self.request(symbols).send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                return Ok(uniform(symbols, FetchOutcome::Transient("request timed out".into())))
            }
            Err(e) => return Ok(uniform(symbols, FetchOutcome::Transient(e.to_string()))),
        };

        let status = response.status();

        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(CollectorError::Configuration(format!(
                "quote source rejected credentials: {status}"
            )));
        }
        if status.as_u16() == 429 {
            return Ok(uniform(symbols, FetchOutcome::Throttled));
        }
        if status.is_server_error() {
            return Ok(uniform(
                symbols,
                FetchOutcome::Transient(format!("provider returned {status}")),
            ));
        }
        if !status.is_success() {
            return Ok(uniform(
                symbols,
                FetchOutcome::Transient(format!("unexpected provider status {status}")),
            ));
        }

        let body = match response.json::<BatchResponse>().await {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "failed to decode provider response body");
                return Ok(uniform(
                    symbols,
                    FetchOutcome::Transient("malformed response body".into()),
                ));
            }
        };

        Ok(symbols
            .iter()
            .map(|symbol| {
                body.quotes
                    .iter()
                    .find(|q| &q.symbol == symbol)
                    .map(to_outcome)
                    .unwrap_or_else(|| {
                        FetchOutcome::Permanent(format!("no entry for {symbol} in provider response"))
                    })
            })
            .collect())
    }

    async fn health_check(&self) -> bool {
        self.client
            .get(format!("{}/health", self.base_url))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}

fn to_outcome(envelope: &QuoteEnvelope) -> FetchOutcome<QuoteRecord> {
    match envelope.status {
        QuoteStatus::NotFound => {
            FetchOutcome::Permanent(envelope.error.clone().unwrap_or_else(|| "symbol not found".into()))
        }
        QuoteStatus::Invalid => {
            FetchOutcome::Permanent(envelope.error.clone().unwrap_or_else(|| "malformed record".into()))
        }
        QuoteStatus::Ok => {
            let Some(price) = envelope.price else {
                return FetchOutcome::Permanent("quote has no price".into());
            };

            let price = PriceQuote {
                price,
                volume: envelope.volume,
                observed_at: envelope.observed_at.unwrap_or_else(Utc::now),
            };

            let fundamentals = if envelope.pe_ratio.is_some()
                || envelope.eps.is_some()
                || envelope.dividend_yield.is_some()
                || envelope.market_cap.is_some()
            {
                Some(FundamentalsQuote {
                    pe_ratio: envelope.pe_ratio,
                    eps: envelope.eps,
                    dividend_yield: envelope.dividend_yield,
                    market_cap: envelope.market_cap,
                    collected_at: Some(Utc::now()),
                })
            } else {
                None
            };

            let history = envelope
                .history
                .iter()
                .map(|bar| HistoryQuote {
                    bar_date: bar.bar_date,
                    open: bar.open,
                    high: bar.high,
                    low: bar.low,
                    close: bar.close,
                    volume: bar.volume,
                })
                .collect();

            FetchOutcome::Success(QuoteRecord {
                symbol: envelope.symbol.clone(),
                asset_type: envelope.asset_type.unwrap_or(AssetType::Equity),
                currency: envelope.currency.clone().unwrap_or_else(|| "USD".to_string()),
                price: Some(price),
                fundamentals,
                history,
            })
        }
    }
}

fn uniform(symbols: &[String], outcome: FetchOutcome<QuoteRecord>) -> Vec<FetchOutcome<QuoteRecord>> {
    symbols.iter().map(|_| outcome.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_envelope_without_fundamentals_fields_yields_no_fundamentals() {
        let envelope = QuoteEnvelope {
            symbol: "AAPL".into(),
            status: QuoteStatus::Ok,
            asset_type: Some(AssetType::Equity),
            currency: Some("USD".into()),
            price: Some(Decimal::new(19999, 2)),
            volume: Some(1000),
            observed_at: Some(Utc::now()),
            pe_ratio: None,
            eps: None,
            dividend_yield: None,
            market_cap: None,
            history: vec![],
            error: None,
        };

        match to_outcome(&envelope) {
            FetchOutcome::Success(record) => assert!(record.fundamentals.is_none()),
            other => panic!("expected Success, got {other:?}"),
        }
    }

    #[test]
    fn not_found_maps_to_permanent() {
        let envelope = QuoteEnvelope {
            symbol: "ZZZZ".into(),
            status: QuoteStatus::NotFound,
            asset_type: None,
            currency: None,
            price: None,
            volume: None,
            observed_at: None,
            pe_ratio: None,
            eps: None,
            dividend_yield: None,
            market_cap: None,
            history: vec![],
            error: Some("unknown ticker".into()),
        };

        assert!(matches!(to_outcome(&envelope), FetchOutcome::Permanent(_)));
    }

    #[test]
    fn missing_symbol_in_response_is_permanent_not_silently_dropped() {
        let symbols = vec!["AAPL".to_string(), "MSFT".to_string()];
        let body = BatchResponse {
            quotes: vec![QuoteEnvelope {
                symbol: "AAPL".into(),
                status: QuoteStatus::Ok,
                asset_type: Some(AssetType::Equity),
                currency: Some("USD".into()),
                price: Some(Decimal::new(100, 0)),
                volume: None,
                observed_at: Some(Utc::now()),
                pe_ratio: None,
                eps: None,
                dividend_yield: None,
                market_cap: None,
                history: vec![],
                error: None,
            }],
        };

        let outcomes: Vec<FetchOutcome<QuoteRecord>> = symbols
            .iter()
            .map(|symbol| {
                body.quotes
                    .iter()
                    .find(|q| &q.symbol == symbol)
                    .map(to_outcome)
                    .unwrap_or_else(|| FetchOutcome::Permanent(format!("no entry for {symbol}")))
            })
            .collect();

        assert!(outcomes[0].is_success());
        assert!(matches!(outcomes[1], FetchOutcome::Permanent(_)));
    }
}
