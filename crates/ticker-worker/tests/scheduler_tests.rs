//! Integration tests for the Scheduler driven entirely against in-memory
//! fakes, per the collector's explicit trait seams (`JobQueue`, `Store`,
//! `JobStore`, `QuoteSource`, `BusinessDayCalendar`) — no broker or database
//! required.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use ticker_core::{
    BusinessDayCalendar, CollectorError, FetchOutcome, Job, JobStatus, JobStore, PriceQuote,
    QuoteRecord, QuoteSource, Settings, Store,
};
use ticker_worker::{Delivery, DeliveryHandle, FetchEngine, FetchEngineConfig, JobMessage, JobQueue, Scheduler};
use uuid::Uuid;

struct FakeDeliveryHandle {
    log: Arc<Mutex<Vec<&'static str>>>,
}

#[async_trait]
impl DeliveryHandle for FakeDeliveryHandle {
    async fn ack(self: Box<Self>) -> anyhow::Result<()> {
        self.log.lock().unwrap().push("ack");
        Ok(())
    }

    async fn nack_requeue(self: Box<Self>) -> anyhow::Result<()> {
        self.log.lock().unwrap().push("nack_requeue");
        Ok(())
    }

    async fn drop_without_requeue(self: Box<Self>) -> anyhow::Result<()> {
        self.log.lock().unwrap().push("drop");
        Ok(())
    }
}

/// Hands out one queued delivery per entry in `inbound`, then blocks forever
/// (mirroring a broker consumer stream with nothing left to deliver) so the
/// scheduler's select loop only exits via shutdown cancellation.
struct FakeJobQueue {
    inbound: Mutex<VecDeque<(JobMessage, Arc<Mutex<Vec<&'static str>>>)>>,
    published: Mutex<Vec<JobMessage>>,
    dlq: Mutex<Vec<JobMessage>>,
}

impl FakeJobQueue {
    fn new(message: JobMessage) -> (Arc<Self>, Arc<Mutex<Vec<&'static str>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let queue = Arc::new(Self {
            inbound: Mutex::new(VecDeque::from([(message, log.clone())])),
            published: Mutex::new(Vec::new()),
            dlq: Mutex::new(Vec::new()),
        });
        (queue, log)
    }

    fn published(&self) -> Vec<JobMessage> {
        self.published.lock().unwrap().clone()
    }

    fn dlq(&self) -> Vec<JobMessage> {
        self.dlq.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobQueue for FakeJobQueue {
    async fn next_delivery(&self) -> Option<Delivery> {
        let popped = self.inbound.lock().unwrap().pop_front();
        match popped {
            Some((message, log)) => Some(Delivery {
                message,
                handle: Box::new(FakeDeliveryHandle { log }),
            }),
            // No more deliveries queued: behave like a broker consumer with
            // nothing left to hand out, so callers only observe this via
            // `shutdown` racing it in a `select!`.
            None => std::future::pending().await,
        }
    }

    async fn publish(&self, message: &JobMessage) -> anyhow::Result<()> {
        self.published.lock().unwrap().push(message.clone());
        Ok(())
    }

    async fn publish_to_dlq(&self, message: &JobMessage) -> anyhow::Result<()> {
        self.dlq.lock().unwrap().push(message.clone());
        Ok(())
    }

    fn is_connected(&self) -> bool {
        true
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

struct FakeJobStore {
    statuses: Mutex<Vec<(Uuid, JobStatus)>>,
}

impl FakeJobStore {
    fn new() -> Self {
        Self {
            statuses: Mutex::new(Vec::new()),
        }
    }

    fn last_status(&self, id: Uuid) -> Option<JobStatus> {
        self.statuses
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(job_id, _)| *job_id == id)
            .map(|(_, status)| *status)
    }
}

#[async_trait]
impl JobStore for FakeJobStore {
    async fn create(
        &self,
        id: Uuid,
        symbols: &[String],
        scheduled_at: chrono::DateTime<Utc>,
    ) -> anyhow::Result<Job> {
        self.statuses.lock().unwrap().push((id, JobStatus::Pending));
        Ok(Job::builder()
            .id(id)
            .symbols(sqlx::types::Json(symbols.to_vec()))
            .scheduled_at(scheduled_at)
            .build())
    }

    async fn find(&self, _id: Uuid) -> anyhow::Result<Option<Job>> {
        Ok(None)
    }

    async fn mark_running(&self, id: Uuid) -> anyhow::Result<()> {
        self.statuses.lock().unwrap().push((id, JobStatus::Running));
        Ok(())
    }

    async fn mark_success(&self, id: Uuid) -> anyhow::Result<()> {
        self.statuses.lock().unwrap().push((id, JobStatus::Success));
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, _retry_count: i32) -> anyhow::Result<()> {
        self.statuses.lock().unwrap().push((id, JobStatus::Failed));
        Ok(())
    }

    async fn mark_pending_with_retry(&self, id: Uuid, _retry_count: i32) -> anyhow::Result<()> {
        self.statuses.lock().unwrap().push((id, JobStatus::Pending));
        Ok(())
    }
}

struct FakeStore {
    saved: Mutex<Vec<QuoteRecord>>,
    fail_symbols: Vec<String>,
}

impl FakeStore {
    fn new() -> Self {
        Self {
            saved: Mutex::new(Vec::new()),
            fail_symbols: Vec::new(),
        }
    }

    fn failing(fail_symbols: Vec<String>) -> Self {
        Self {
            saved: Mutex::new(Vec::new()),
            fail_symbols,
        }
    }
}

#[async_trait]
impl Store for FakeStore {
    async fn save_all(&self, records: Vec<QuoteRecord>) -> (usize, Vec<String>) {
        let mut saved = 0;
        let mut failed = Vec::new();
        for record in records {
            if self.fail_symbols.contains(&record.symbol) {
                failed.push(record.symbol.clone());
            } else {
                saved += 1;
                self.saved.lock().unwrap().push(record);
            }
        }
        (saved, failed)
    }
}

struct ScriptedQuoteSource {
    scripts: Mutex<VecDeque<Vec<FetchOutcome<QuoteRecord>>>>,
}

impl ScriptedQuoteSource {
    fn new(scripts: Vec<Vec<FetchOutcome<QuoteRecord>>>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
        }
    }
}

#[async_trait]
impl QuoteSource for ScriptedQuoteSource {
    async fn fetch_batch(
        &self,
        _symbols: &[String],
    ) -> Result<Vec<FetchOutcome<QuoteRecord>>, CollectorError> {
        let mut scripts = self.scripts.lock().unwrap();
        if scripts.len() > 1 {
            Ok(scripts.pop_front().unwrap())
        } else {
            Ok(scripts.front().cloned().unwrap_or_default())
        }
    }
}

struct AlwaysBusinessDay;

impl BusinessDayCalendar for AlwaysBusinessDay {
    fn is_business_day(&self, _date: NaiveDate) -> bool {
        true
    }
}

fn sample_record(symbol: &str) -> QuoteRecord {
    QuoteRecord {
        symbol: symbol.to_string(),
        asset_type: ticker_core::AssetType::Equity,
        currency: "USD".to_string(),
        price: Some(PriceQuote {
            price: rust_decimal::Decimal::new(100, 0),
            volume: Some(1000),
            observed_at: Utc::now(),
        }),
        fundamentals: None,
        history: vec![],
    }
}

fn test_settings() -> Settings {
    Settings {
        database_url: String::new(),
        queue_url: String::new(),
        quote_source_url: String::new(),
        quote_source_api_key: None,
        monitored_symbols: vec!["AAPL".to_string()],
        timezone: "UTC".to_string(),
        execution_time: "00:00".to_string(),
        batch_size: 10,
        inter_batch_delay: Duration::from_millis(1),
        max_retries: 3,
        backoff_base_secs: 0,
        backoff_max_secs: 0,
        db_pool_size: 1,
        db_pool_overflow: 0,
        health_port: 0,
        log_level: "error".to_string(),
        log_format: ticker_core::LogFormat::Human,
    }
}

fn fetch_engine(quote_source: Arc<dyn QuoteSource>, rate_limit_tracker: Arc<dyn ticker_core::RateLimitTracker>) -> FetchEngine {
    FetchEngine::new(
        quote_source,
        rate_limit_tracker,
        FetchEngineConfig {
            batch_size: 10,
            inter_batch_delay: Duration::from_millis(1),
            max_retries: 3,
            backoff_base_secs: 0,
            backoff_max_secs: 0,
        },
    )
}

struct NoopRateLimitTracker;

#[async_trait]
impl ticker_core::RateLimitTracker for NoopRateLimitTracker {
    async fn open(&self, _symbol: Option<&str>, _retry_count: i32) -> anyhow::Result<ticker_core::RateLimitEvent> {
        unreachable!("not exercised by these tests")
    }
    async fn close(&self, _symbol: Option<&str>) -> anyhow::Result<()> {
        Ok(())
    }
    async fn active(&self, _symbol: Option<&str>) -> anyhow::Result<bool> {
        Ok(false)
    }
    async fn stats(&self, _symbol: &str) -> anyhow::Result<ticker_core::RateLimitStats> {
        Ok(Default::default())
    }
}

#[tokio::test]
async fn happy_path_marks_success_persists_and_enqueues_successor() {
    let job_id = Uuid::new_v4();
    let message = JobMessage {
        job_id,
        ticker_list: vec!["AAPL".to_string()],
        execution_time: Utc::now() - chrono::Duration::seconds(5),
        retry_count: 0,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };

    let (queue, ack_log) = FakeJobQueue::new(message);
    let job_store = Arc::new(FakeJobStore::new());
    let store = Arc::new(FakeStore::new());
    let quote_source: Arc<dyn QuoteSource> = Arc::new(ScriptedQuoteSource::new(vec![vec![
        FetchOutcome::Success(sample_record("AAPL")),
    ]]));

    let engine = fetch_engine(quote_source, Arc::new(NoopRateLimitTracker));
    let scheduler = Scheduler::new(
        queue.clone(),
        job_store.clone(),
        store.clone(),
        engine,
        Arc::new(AlwaysBusinessDay),
        test_settings(),
    );

    let shutdown = tokio_util::sync::CancellationToken::new();
    let shutdown_for_task = shutdown.clone();
    let handle = tokio::spawn(async move { scheduler.run(shutdown_for_task).await });

    // Give the spawned task a few scheduling turns to process the one
    // queued delivery before asking it to stop.
    for _ in 0..50 {
        if !queue.published().is_empty() {
            break;
        }
        tokio::task::yield_now().await;
    }
    shutdown.cancel();
    handle.await.unwrap().unwrap();

    assert_eq!(*ack_log.lock().unwrap(), vec!["ack"]);
    assert_eq!(job_store.last_status(job_id), Some(JobStatus::Success));
    assert_eq!(store.saved.lock().unwrap().len(), 1);

    let published = queue.published();
    assert_eq!(published.len(), 1);
    assert_ne!(published[0].job_id, job_id);
    assert_eq!(published[0].ticker_list, vec!["AAPL".to_string()]);
    assert_eq!(published[0].retry_count, 0);
}

#[tokio::test]
async fn partial_persist_failure_does_not_block_the_rest_of_the_run() {
    let job_id = Uuid::new_v4();
    let message = JobMessage {
        job_id,
        ticker_list: vec!["AAPL".to_string(), "MSFT".to_string()],
        execution_time: Utc::now() - chrono::Duration::seconds(5),
        retry_count: 0,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };

    let (queue, _ack_log) = FakeJobQueue::new(message);
    let job_store = Arc::new(FakeJobStore::new());
    let store = Arc::new(FakeStore::failing(vec!["MSFT".to_string()]));
    let quote_source: Arc<dyn QuoteSource> = Arc::new(ScriptedQuoteSource::new(vec![vec![
        FetchOutcome::Success(sample_record("AAPL")),
        FetchOutcome::Success(sample_record("MSFT")),
    ]]));

    let engine = fetch_engine(quote_source, Arc::new(NoopRateLimitTracker));
    let scheduler = Scheduler::new(
        queue.clone(),
        job_store.clone(),
        store.clone(),
        engine,
        Arc::new(AlwaysBusinessDay),
        test_settings(),
    );

    let shutdown = tokio_util::sync::CancellationToken::new();
    let shutdown_for_task = shutdown.clone();
    let handle = tokio::spawn(async move { scheduler.run(shutdown_for_task).await });

    for _ in 0..50 {
        if !queue.published().is_empty() {
            break;
        }
        tokio::task::yield_now().await;
    }
    shutdown.cancel();
    handle.await.unwrap().unwrap();

    // One symbol's transaction failed, but the job as a whole still
    // completes: the audit row is Success and the successor is enqueued.
    assert_eq!(job_store.last_status(job_id), Some(JobStatus::Success));
    assert_eq!(store.saved.lock().unwrap().len(), 1);
    assert_eq!(queue.published().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn not_yet_due_job_is_acked_and_republished_unchanged_after_the_poll_delay() {
    let job_id = Uuid::new_v4();
    let execution_time = Utc::now() + chrono::Duration::hours(2);
    let message = JobMessage {
        job_id,
        ticker_list: vec!["AAPL".to_string()],
        execution_time,
        retry_count: 0,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };

    let (queue, ack_log) = FakeJobQueue::new(message);
    let job_store = Arc::new(FakeJobStore::new());
    let store = Arc::new(FakeStore::new());
    let quote_source: Arc<dyn QuoteSource> = Arc::new(ScriptedQuoteSource::new(vec![vec![]]));

    let engine = fetch_engine(quote_source, Arc::new(NoopRateLimitTracker));
    let scheduler = Scheduler::new(
        queue.clone(),
        job_store,
        store,
        engine,
        Arc::new(AlwaysBusinessDay),
        test_settings(),
    );

    let shutdown = tokio_util::sync::CancellationToken::new();
    let shutdown_for_task = shutdown.clone();
    let handle = tokio::spawn(async move { scheduler.run(shutdown_for_task).await });

    // Drive the paused clock past the cooperative-poll delay.
    tokio::time::sleep(Duration::from_secs(31)).await;

    shutdown.cancel();
    handle.await.unwrap().unwrap();

    assert_eq!(*ack_log.lock().unwrap(), vec!["ack"]);
    let published = queue.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].job_id, job_id);
    assert_eq!(published[0].execution_time, execution_time);
    assert_eq!(published[0].retry_count, 0);
}

#[tokio::test]
async fn non_business_day_is_acked_and_republished_with_advanced_execution_time() {
    struct NeverBusinessDay;
    impl BusinessDayCalendar for NeverBusinessDay {
        fn is_business_day(&self, _date: NaiveDate) -> bool {
            false
        }
        fn next_business_day(&self, date: NaiveDate) -> NaiveDate {
            date.succ_opt().unwrap()
        }
    }

    let job_id = Uuid::new_v4();
    let message = JobMessage {
        job_id,
        ticker_list: vec!["AAPL".to_string()],
        execution_time: Utc::now(),
        retry_count: 0,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };

    let (queue, ack_log) = FakeJobQueue::new(message.clone());
    let job_store = Arc::new(FakeJobStore::new());
    let store = Arc::new(FakeStore::new());
    let quote_source: Arc<dyn QuoteSource> = Arc::new(ScriptedQuoteSource::new(vec![vec![]]));

    let engine = fetch_engine(quote_source, Arc::new(NoopRateLimitTracker));
    let scheduler = Scheduler::new(
        queue.clone(),
        job_store,
        store,
        engine,
        Arc::new(NeverBusinessDay),
        test_settings(),
    );

    let shutdown = tokio_util::sync::CancellationToken::new();
    let shutdown_for_task = shutdown.clone();
    let handle = tokio::spawn(async move { scheduler.run(shutdown_for_task).await });

    for _ in 0..50 {
        if !queue.published().is_empty() {
            break;
        }
        tokio::task::yield_now().await;
    }
    shutdown.cancel();
    handle.await.unwrap().unwrap();

    assert_eq!(*ack_log.lock().unwrap(), vec!["ack"]);
    let published = queue.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].job_id, job_id);
    assert!(published[0].execution_time > message.execution_time);
}

#[tokio::test]
async fn retry_ceiling_exhaustion_dead_letters_instead_of_retrying_forever() {
    // The successor publish fails every time, forcing the scheduler's own
    // job-level retry loop (distinct from the Fetch Engine's per-symbol
    // retry) to exhaust `max_retries` and dead-letter.
    struct AlwaysFailingPublishQueue {
        inner: Arc<FakeJobQueue>,
    }

    #[async_trait]
    impl JobQueue for AlwaysFailingPublishQueue {
        async fn next_delivery(&self) -> Option<Delivery> {
            self.inner.next_delivery().await
        }
        async fn publish(&self, _message: &JobMessage) -> anyhow::Result<()> {
            anyhow::bail!("broker publish failed")
        }
        async fn publish_to_dlq(&self, message: &JobMessage) -> anyhow::Result<()> {
            self.inner.publish_to_dlq(message).await
        }
        fn is_connected(&self) -> bool {
            true
        }
        async fn close(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    let job_id = Uuid::new_v4();
    let message = JobMessage {
        job_id,
        ticker_list: vec!["AAPL".to_string()],
        execution_time: Utc::now() - chrono::Duration::seconds(5),
        retry_count: 0,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };

    let (inner, ack_log) = FakeJobQueue::new(message);
    let queue = Arc::new(AlwaysFailingPublishQueue { inner: inner.clone() });
    let job_store = Arc::new(FakeJobStore::new());
    let store = Arc::new(FakeStore::new());
    let quote_source: Arc<dyn QuoteSource> = Arc::new(ScriptedQuoteSource::new(vec![vec![
        FetchOutcome::Success(sample_record("AAPL")),
    ]]));

    let mut settings = test_settings();
    settings.max_retries = 1;

    let engine = fetch_engine(quote_source, Arc::new(NoopRateLimitTracker));
    let scheduler = Scheduler::new(
        queue.clone(),
        job_store.clone(),
        store,
        engine,
        Arc::new(AlwaysBusinessDay),
        settings,
    );

    let shutdown = tokio_util::sync::CancellationToken::new();
    let shutdown_for_task = shutdown.clone();
    let handle = tokio::spawn(async move { scheduler.run(shutdown_for_task).await });

    for _ in 0..50 {
        if !inner.dlq().is_empty() {
            break;
        }
        tokio::task::yield_now().await;
    }
    shutdown.cancel();
    handle.await.unwrap().unwrap();

    assert_eq!(*ack_log.lock().unwrap(), vec!["drop"]);
    assert_eq!(job_store.last_status(job_id), Some(JobStatus::Failed));
    let dlq = inner.dlq();
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].job_id, job_id);
    assert_eq!(dlq[0].retry_count, 1);
}

/// A `QuoteSource` that blocks until explicitly released, so a test can hold
/// a job "in flight" across a shutdown signal.
struct StallingQuoteSource {
    release: tokio::sync::Notify,
}

#[async_trait]
impl QuoteSource for StallingQuoteSource {
    async fn fetch_batch(
        &self,
        symbols: &[String],
    ) -> Result<Vec<FetchOutcome<QuoteRecord>>, CollectorError> {
        self.release.notified().await;
        Ok(symbols
            .iter()
            .map(|s| FetchOutcome::Success(sample_record(s)))
            .collect())
    }
}

#[tokio::test(start_paused = true)]
async fn shutdown_grace_timeout_falls_the_in_flight_job_back_to_pending() {
    let job_id = Uuid::new_v4();
    let message = JobMessage {
        job_id,
        ticker_list: vec!["AAPL".to_string()],
        execution_time: Utc::now() - chrono::Duration::seconds(5),
        retry_count: 0,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };

    let (queue, _ack_log) = FakeJobQueue::new(message);
    let job_store = Arc::new(FakeJobStore::new());
    let store = Arc::new(FakeStore::new());
    let quote_source: Arc<dyn QuoteSource> = Arc::new(StallingQuoteSource {
        release: tokio::sync::Notify::new(),
    });

    let engine = fetch_engine(quote_source, Arc::new(NoopRateLimitTracker));
    let scheduler = Scheduler::new(
        queue.clone(),
        job_store.clone(),
        store,
        engine,
        Arc::new(AlwaysBusinessDay),
        test_settings(),
    );

    let shutdown = tokio_util::sync::CancellationToken::new();
    let shutdown_for_task = shutdown.clone();
    let handle = tokio::spawn(async move { scheduler.run(shutdown_for_task).await });

    // Let the scheduler pick up the delivery and block inside the stalled
    // fetch (mark_running has definitely happened by the time it's stuck).
    for _ in 0..50 {
        if job_store.last_status(job_id) == Some(JobStatus::Running) {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(job_store.last_status(job_id), Some(JobStatus::Running));

    shutdown.cancel();
    // The fetch never releases, so the 30s shutdown-grace timeout has to
    // elapse before `run` returns on its own; drive the paused clock past
    // it rather than actually waiting in real time.
    tokio::time::sleep(Duration::from_secs(31)).await;
    handle.await.unwrap().unwrap();

    assert_eq!(job_store.last_status(job_id), Some(JobStatus::Pending));
}
