//! Scheduler/Consumer: the sole driver of work. Consumes `ticker_updates`,
//! gates each delivery on wall-clock/business-day, orchestrates the Fetch
//! Engine and Persistence Layer, and enqueues the next day's job on success.
//!
//! Mirrors this codebase's job-runner services (poll, execute, mark status,
//! `run_until_shutdown`) but is driven by broker deliveries rather than a
//! database poll loop, since the collector's queue message *is* the unit of
//! scheduling.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use ticker_core::{BusinessDayCalendar, JobStore, Settings, Store};

use crate::fetch_engine::{is_catastrophic, FetchEngine};
use crate::queue::{Delivery, JobMessage, JobQueue};

/// How long the scheduler cooperatively polls before re-checking a message
/// that isn't due yet. Matches the spec's "typical 30 s" requeue delay.
const POLL_DELAY: Duration = Duration::from_secs(30);

/// Soft deadline on the in-flight job once shutdown is requested.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

pub struct Scheduler {
    queue: Arc<dyn JobQueue>,
    job_store: Arc<dyn JobStore>,
    store: Arc<dyn Store>,
    fetch_engine: FetchEngine,
    calendar: Arc<dyn BusinessDayCalendar>,
    settings: Settings,
    /// The job id currently being executed, if any, so the shutdown-grace
    /// timeout path can fall the audit row back to `Pending` without having
    /// to thread the id through `run_with_shutdown_grace`'s generic future.
    in_flight: Mutex<Option<(Uuid, i32)>>,
}

impl Scheduler {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        job_store: Arc<dyn JobStore>,
        store: Arc<dyn Store>,
        fetch_engine: FetchEngine,
        calendar: Arc<dyn BusinessDayCalendar>,
        settings: Settings,
    ) -> Self {
        Self {
            queue,
            job_store,
            store,
            fetch_engine,
            calendar,
            settings,
            in_flight: Mutex::new(None),
        }
    }

    /// Run until `shutdown` is cancelled. Stops accepting new deliveries,
    /// lets the in-flight job finish within `SHUTDOWN_GRACE`, and closes the
    /// broker connection before returning.
    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        info!("scheduler starting, consuming ticker_updates");

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let delivery = tokio::select! {
                _ = shutdown.cancelled() => break,
                d = self.queue.next_delivery() => d,
            };

            let Some(delivery) = delivery else {
                continue;
            };

            let outcome = run_with_shutdown_grace(
                self.process_delivery(delivery, &shutdown),
                shutdown.clone(),
                SHUTDOWN_GRACE,
            )
            .await;

            match outcome {
                None => {
                    warn!("shutdown grace period elapsed with a job still in flight");
                    if let Some((job_id, retry_count)) = *self.in_flight.lock().await {
                        if let Err(e) = self.job_store.mark_pending_with_retry(job_id, retry_count).await {
                            error!(job_id = %job_id, error = %e, "failed to fall back in-flight job to pending");
                        }
                    }
                    break;
                }
                Some(Err(e)) => {
                    error!(error = %e, "catastrophic failure, stopping scheduler");
                    self.queue.close().await?;
                    return Err(e);
                }
                Some(Ok(())) => {}
            }
        }

        self.queue.close().await?;
        info!("scheduler stopped");
        Ok(())
    }

    async fn process_delivery(&self, delivery: Delivery, shutdown: &CancellationToken) -> anyhow::Result<()> {
        let message = delivery.message.clone();
        let now = Utc::now();

        match self.gate(&message, now) {
            Gate::Due => self.execute(delivery, shutdown).await,
            Gate::NotYetTime => {
                self.cooperative_poll(delivery, shutdown).await;
                Ok(())
            }
            Gate::NotABusinessDay(next_execution_time) => {
                self.advance_to_next_business_day(delivery, next_execution_time).await;
                Ok(())
            }
        }
    }

    /// Decide whether `message` is due, should be polled again shortly, or
    /// should be advanced to the next business day.
    fn gate(&self, message: &JobMessage, now: DateTime<Utc>) -> Gate {
        let tz = self.timezone();
        let today_local = now.with_timezone(&tz).date_naive();

        if !self.calendar.is_business_day(today_local) {
            let next_date = self.calendar.next_business_day(today_local);
            let next_instant = self.zone_local_instant(next_date);
            return Gate::NotABusinessDay(next_instant);
        }

        if now < message.execution_time {
            return Gate::NotYetTime;
        }

        Gate::Due
    }

    fn timezone(&self) -> Tz {
        self.settings
            .timezone
            .parse::<Tz>()
            .unwrap_or(chrono_tz::America::Sao_Paulo)
    }

    fn execution_time_of_day(&self) -> NaiveTime {
        parse_execution_time(&self.settings.execution_time).unwrap_or(
            NaiveTime::from_hms_opt(16, 30, 0).expect("16:30:00 is a valid time"),
        )
    }

    /// The configured `execution_time` on `date`, expressed as a UTC instant,
    /// computed in the configured zone so "next business day" never drifts
    /// across a UTC offset boundary (the ambiguity called out as an open
    /// question in the distilled spec).
    fn zone_local_instant(&self, date: chrono::NaiveDate) -> DateTime<Utc> {
        let tz = self.timezone();
        let local_dt = date.and_time(self.execution_time_of_day());
        tz.from_local_datetime(&local_dt)
            .single()
            .unwrap_or_else(|| tz.from_utc_datetime(&local_dt))
            .with_timezone(&Utc)
    }

    /// Requeue the same message unchanged after a short cooperative delay.
    /// Acks immediately so the broker doesn't count this as a failed
    /// delivery; the successor publish is what actually re-schedules it.
    async fn cooperative_poll(&self, delivery: Delivery, shutdown: &CancellationToken) {
        let message = delivery.message.clone();
        if let Err(e) = delivery.ack().await {
            error!(error = %e, "failed to ack not-yet-due delivery");
            return;
        }

        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = tokio::time::sleep(POLL_DELAY) => {
                if let Err(e) = self.queue.publish(&message).await {
                    error!(job_id = %message.job_id, error = %e, "failed to republish not-yet-due job");
                }
            }
        }
    }

    async fn advance_to_next_business_day(&self, delivery: Delivery, next_execution_time: DateTime<Utc>) {
        let mut message = delivery.message.clone();
        message.execution_time = next_execution_time;
        message.updated_at = Utc::now();

        if let Err(e) = self.queue.publish(&message).await {
            error!(job_id = %message.job_id, error = %e, "failed to requeue job past a non-business day");
            let _ = delivery.nack_requeue().await;
            return;
        }

        if let Err(e) = delivery.ack().await {
            error!(error = %e, "failed to ack non-business-day delivery after requeue");
        }
    }

    /// The job is due: run it end to end. Returns `Err` only when the fetch
    /// engine surfaces a catastrophic error (loss of quote source
    /// configuration or similar); that is propagated out of `run()` so the
    /// process exits rather than spinning on a failure no retry can fix.
    async fn execute(&self, delivery: Delivery, shutdown: &CancellationToken) -> anyhow::Result<()> {
        let message = delivery.message.clone();
        let job_id = message.job_id;

        if let Err(e) = self
            .job_store
            .create(job_id, &message.ticker_list, message.execution_time)
            .await
        {
            error!(job_id = %job_id, error = %e, "failed to create job audit row");
        }
        if let Err(e) = self.job_store.mark_running(job_id).await {
            error!(job_id = %job_id, error = %e, "failed to mark job running");
        }

        *self.in_flight.lock().await = Some((job_id, message.retry_count));

        let fetch_result = self.fetch_engine.fetch(&message.ticker_list, shutdown).await;

        let fetch_result = match fetch_result {
            Ok(r) => r,
            Err(e) => {
                *self.in_flight.lock().await = None;
                if is_catastrophic(&e) {
                    error!(job_id = %job_id, error = %e, "catastrophic fetch failure, not retrying");
                    let _ = delivery.nack_requeue().await;
                    return Err(e.into());
                }
                error!(job_id = %job_id, error = %e, "fetch failure");
                self.handle_failure(delivery, message).await;
                return Ok(());
            }
        };

        let (saved, persist_failures) = self.store.save_all(fetch_result.successes).await;
        *self.in_flight.lock().await = None;

        info!(
            job_id = %job_id,
            saved,
            permanent_fetch_failures = fetch_result.permanent_failures.len(),
            persist_failures = persist_failures.len(),
            "job run complete"
        );

        let next_date = self.timezone_date(Utc::now());
        let next_business_day = self.calendar.next_business_day(next_date);
        let next_execution_time = self.zone_local_instant(next_business_day);
        let successor = message.next_run(next_execution_time);

        if let Err(e) = self.queue.publish(&successor).await {
            error!(job_id = %job_id, error = %e, "failed to enqueue successor job; not marking success");
            self.handle_failure(delivery, message).await;
            return Ok(());
        }

        if let Err(e) = self.job_store.mark_success(job_id).await {
            error!(job_id = %job_id, error = %e, "failed to mark job success");
        }

        if let Err(e) = delivery.ack().await {
            error!(job_id = %job_id, error = %e, "failed to ack completed delivery");
        }

        Ok(())
    }

    fn timezone_date(&self, instant: DateTime<Utc>) -> chrono::NaiveDate {
        instant.with_timezone(&self.timezone()).date_naive()
    }

    /// Increment `retry_count`; requeue if under `max_retries`, otherwise
    /// dead-letter and mark the job row `Failed`.
    async fn handle_failure(&self, delivery: Delivery, message: JobMessage) {
        let job_id = message.job_id;
        let retried = message.with_incremented_retry();

        if retried.retry_count < self.settings.max_retries as i32 {
            if let Err(e) = self.job_store.mark_pending_with_retry(job_id, retried.retry_count).await {
                error!(job_id = %job_id, error = %e, "failed to record retry count");
            }
            if let Err(e) = self.queue.publish(&retried).await {
                error!(job_id = %job_id, error = %e, "failed to republish retried job");
            }
            let _ = delivery.ack().await;
        } else {
            warn!(job_id = %job_id, retry_count = retried.retry_count, "retry ceiling exhausted, routing to DLQ");
            if let Err(e) = self.job_store.mark_failed(job_id, retried.retry_count).await {
                error!(job_id = %job_id, error = %e, "failed to mark job failed");
            }
            if let Err(e) = self.queue.publish_to_dlq(&retried).await {
                error!(job_id = %job_id, error = %e, "failed to publish to dead-letter queue");
            }
            let _ = delivery.drop_without_requeue().await;
        }
    }
}

enum Gate {
    Due,
    NotYetTime,
    NotABusinessDay(DateTime<Utc>),
}

/// Parse `"HH:MM"` or `"HH:MM:SS"` into a `NaiveTime`.
fn parse_execution_time(raw: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(raw, "%H:%M:%S").ok().or_else(|| NaiveTime::parse_from_str(raw, "%H:%M").ok())
}

/// Runs `fut` to completion unless `shutdown` is cancelled; once cancelled,
/// gives it `grace` more time before giving up and returning `None`. This is
/// the soft-deadline counterpart to the cooperative cancellation the fetch
/// engine's sleeps already respect via `tokio::select!`.
async fn run_with_shutdown_grace<Fut>(
    fut: Fut,
    shutdown: CancellationToken,
    grace: Duration,
) -> Option<Fut::Output>
where
    Fut: Future,
{
    tokio::pin!(fut);
    tokio::select! {
        out = &mut fut => return Some(out),
        _ = shutdown.cancelled() => {}
    }

    tokio::select! {
        out = &mut fut => Some(out),
        _ = tokio::time::sleep(grace) => None,
    }
}
