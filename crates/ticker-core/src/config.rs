//! Immutable configuration snapshot loaded once at process startup.
//!
//! `Settings` replaces the "read an env var wherever it's needed" pattern
//! with a single value constructed at startup and passed by reference into
//! every component, so no part of the collector reaches into the process
//! environment after `Settings::from_env` returns.

use anyhow::{Context, Result};
use std::env;
use std::time::Duration;

/// Collector configuration, loaded once from the process environment.
#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    pub queue_url: String,
    pub quote_source_url: String,
    pub quote_source_api_key: Option<String>,

    /// Symbols to collect when no job message specifies an override.
    pub monitored_symbols: Vec<String>,

    /// IANA timezone the scheduler evaluates wall-clock gating in, e.g.
    /// `America/Chicago`. Never UTC by default, since "next business day"
    /// is meaningless without a local calendar.
    pub timezone: String,

    /// Local time of day a run is scheduled for, e.g. "09:00:00".
    pub execution_time: String,

    pub batch_size: usize,
    pub inter_batch_delay: Duration,
    pub max_retries: u32,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,

    pub db_pool_size: u32,
    pub db_pool_overflow: u32,

    pub health_port: u16,

    pub log_level: String,
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Human,
    Json,
}

impl Settings {
    /// Load configuration from environment variables, optionally preloaded
    /// from a `.env` file in development. Returns a `Configuration`-kind
    /// error (via `anyhow::Context`) on anything missing or unparseable;
    /// the caller treats this as fatal at startup (exit code 1).
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();

        let monitored_symbols = env::var("MONITORED_SYMBOLS")
            .context("MONITORED_SYMBOLS must be set (comma-separated ticker list)")?
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        if monitored_symbols.is_empty() {
            anyhow::bail!("MONITORED_SYMBOLS must contain at least one symbol");
        }

        let log_format = match env::var("LOG_FORMAT")
            .unwrap_or_else(|_| "human".to_string())
            .to_lowercase()
            .as_str()
        {
            "json" => LogFormat::Json,
            _ => LogFormat::Human,
        };

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            queue_url: env::var("QUEUE_URL").context("QUEUE_URL must be set")?,
            quote_source_url: env::var("QUOTE_SOURCE_URL")
                .context("QUOTE_SOURCE_URL must be set")?,
            quote_source_api_key: env::var("QUOTE_SOURCE_API_KEY").ok(),
            monitored_symbols,
            timezone: env::var("COLLECTOR_TIMEZONE")
                .unwrap_or_else(|_| "America/Sao_Paulo".to_string()),
            execution_time: env::var("EXECUTION_TIME").unwrap_or_else(|_| "16:30".to_string()),
            batch_size: env_parse("BATCH_SIZE", 10)?,
            inter_batch_delay: Duration::from_millis(env_parse("INTER_BATCH_DELAY_MS", 300)?),
            max_retries: env_parse("MAX_RETRIES", 10)?,
            backoff_base_secs: env_parse("BACKOFF_BASE", 2)?,
            backoff_max_secs: env_parse("BACKOFF_MAX_SECONDS", 3600)?,
            db_pool_size: env_parse("DB_POOL_SIZE", 10)?,
            db_pool_overflow: env_parse("DB_POOL_OVERFLOW", 20)?,
            health_port: env_parse("HEALTH_PORT", 8080)?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            log_format,
        })
    }
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("{key} must be a valid value: {e}")),
        Err(_) => Ok(default),
    }
}
