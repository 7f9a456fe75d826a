//! Ticker collector process entry point.
//!
//! Loads `Settings` from the environment, wires the `Kernel` (database pool,
//! store, rate-limit tracker, quote source, business-day calendar), connects
//! to the broker, and runs the scheduler/consumer and the health-check HTTP
//! server side by side until a shutdown signal arrives.

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ticker_core::{
    BusinessDayCalendar, LogFormat, PostgresJobStore, PostgresRateLimitTracker, PostgresStore,
    Settings, WeekdayCalendar,
};
use ticker_worker::health::{self, HealthState};
use ticker_worker::{
    AmqpQueue, FetchEngine, FetchEngineConfig, HttpQuoteSource, JobQueue, Kernel, Scheduler,
};

#[tokio::main]
async fn main() -> Result<()> {
    let settings = match Settings::from_env() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("configuration error: {e:#}");
            std::process::exit(1);
        }
    };

    init_tracing(&settings);

    tracing::info!(
        timezone = %settings.timezone,
        execution_time = %settings.execution_time,
        symbols = settings.monitored_symbols.len(),
        "starting ticker collector"
    );

    match run(settings).await {
        Ok(()) => {
            tracing::info!("shut down gracefully");
            Ok(())
        }
        Err(e) => {
            tracing::error!(error = %e, "unrecoverable dependency failure");
            std::process::exit(2);
        }
    }
}

async fn run(settings: Settings) -> Result<()> {
    let pool = PgPoolOptions::new()
        .max_connections(settings.db_pool_size + settings.db_pool_overflow)
        .connect(&settings.database_url)
        .await
        .context("failed to connect to database")?;

    sqlx::migrate!("../../migrations")
        .run(&pool)
        .await
        .context("failed to run database migrations")?;

    let store: Arc<dyn ticker_core::Store> = Arc::new(PostgresStore::new(pool.clone()));
    let rate_limit_tracker: Arc<dyn ticker_core::RateLimitTracker> =
        Arc::new(PostgresRateLimitTracker::new(pool.clone()));
    let job_store: Arc<dyn ticker_core::JobStore> = Arc::new(PostgresJobStore::new(pool.clone()));
    let quote_source: Arc<dyn ticker_core::QuoteSource> = Arc::new(
        HttpQuoteSource::new(settings.quote_source_url.clone(), settings.quote_source_api_key.clone())
            .context("failed to build quote source client")?,
    );
    let business_day_calendar: Arc<dyn BusinessDayCalendar> = Arc::new(WeekdayCalendar);

    let kernel = Arc::new(Kernel::new(
        pool.clone(),
        store.clone(),
        rate_limit_tracker.clone(),
        quote_source.clone(),
        business_day_calendar.clone(),
        settings.clone(),
    ));

    let queue: Arc<dyn JobQueue> = Arc::new(
        AmqpQueue::connect(&settings.queue_url)
            .await
            .context("failed to connect to broker")?,
    );

    let fetch_engine = FetchEngine::new(
        quote_source,
        rate_limit_tracker,
        FetchEngineConfig {
            batch_size: settings.batch_size,
            inter_batch_delay: settings.inter_batch_delay,
            max_retries: settings.max_retries,
            backoff_base_secs: settings.backoff_base_secs,
            backoff_max_secs: settings.backoff_max_secs,
        },
    );

    let scheduler = Scheduler::new(
        queue.clone(),
        job_store,
        store,
        fetch_engine,
        business_day_calendar,
        settings.clone(),
    );

    let shutdown = CancellationToken::new();

    let health_router = health::router(HealthState {
        kernel: kernel.clone(),
        queue: queue.clone(),
    });
    let health_addr = format!("0.0.0.0:{}", settings.health_port);
    let health_listener = tokio::net::TcpListener::bind(&health_addr)
        .await
        .context("failed to bind health probe listener")?;
    tracing::info!(addr = %health_addr, "health probe listening");

    let health_shutdown = shutdown.clone();
    let health_task = tokio::spawn(async move {
        axum::serve(health_listener, health_router)
            .with_graceful_shutdown(async move { health_shutdown.cancelled().await })
            .await
    });

    let scheduler_shutdown = shutdown.clone();
    let scheduler_task = tokio::spawn(async move { scheduler.run(scheduler_shutdown).await });

    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received, draining in-flight work");
    shutdown.cancel();

    let scheduler_result = scheduler_task.await.context("scheduler task panicked")?;
    let _ = health_task.await;

    scheduler_result
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn init_tracing(settings: &Settings) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("{},sqlx=warn", settings.log_level).into());

    let registry = tracing_subscriber::registry().with(filter);

    match settings.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Human => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}
