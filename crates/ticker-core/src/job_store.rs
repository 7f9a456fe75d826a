//! Persistence for the audit `Job` row backing one `ticker_updates` queue
//! message. Distinct from `queue::JobMessage` in the worker crate (the wire
//! shape); this is the database-side record of what the scheduler has done
//! with that message so far.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::domain::{Job, JobStatus};

/// Tracks the lifecycle of collection jobs: `Pending -> Running ->
/// Success|Failed`. The scheduler is the only writer; `PostgresJobStore`
/// enforces `JobStatus::can_transition_to` under a row lock before every
/// write, so an illegal transition (e.g. advancing an already-terminal job)
/// is rejected rather than silently applied.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new audit row for a job message, in `Pending` status.
    async fn create(&self, id: Uuid, symbols: &[String], scheduled_at: DateTime<Utc>)
        -> anyhow::Result<Job>;

    /// Fetch a job's current audit row by id, if one exists.
    async fn find(&self, id: Uuid) -> anyhow::Result<Option<Job>>;

    /// Transition a job to `Running`, stamping `last_attempted_at`.
    async fn mark_running(&self, id: Uuid) -> anyhow::Result<()>;

    /// Transition a job to `Success`.
    async fn mark_success(&self, id: Uuid) -> anyhow::Result<()>;

    /// Transition a job to `Failed` (retry ceiling exhausted; routed to the
    /// DLQ).
    async fn mark_failed(&self, id: Uuid, retry_count: i32) -> anyhow::Result<()>;

    /// Increment `retry_count` and move back to `Pending` so the broker's
    /// redelivery can pick the job back up. Used both for ordinary retry and
    /// for the shutdown path, where the in-flight job must not be left
    /// `Running` across a restart.
    async fn mark_pending_with_retry(&self, id: Uuid, retry_count: i32) -> anyhow::Result<()>;
}

pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn create(
        &self,
        id: Uuid,
        symbols: &[String],
        scheduled_at: DateTime<Utc>,
    ) -> anyhow::Result<Job> {
        let job = sqlx::query_as::<_, Job>(
            r#"
            INSERT INTO jobs (id, symbols, scheduled_at, retry_count, status, created_at, updated_at)
            VALUES ($1, $2, $3, 0, 'pending', NOW(), NOW())
            ON CONFLICT (id) DO UPDATE SET updated_at = jobs.updated_at
            RETURNING id, symbols, scheduled_at, retry_count, status, last_attempted_at, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(sqlx::types::Json(symbols.to_vec()))
        .bind(scheduled_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(job)
    }

    async fn find(&self, id: Uuid) -> anyhow::Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(
            r#"
            SELECT id, symbols, scheduled_at, retry_count, status, last_attempted_at, created_at, updated_at
            FROM jobs WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    async fn mark_running(&self, id: Uuid) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        let current = locked_status(&mut tx, id).await?;
        if !current.can_transition_to(JobStatus::Running) {
            anyhow::bail!("illegal job transition: {id} is {current:?}, cannot become Running");
        }

        sqlx::query(
            r#"
            UPDATE jobs SET status = 'running', last_attempted_at = NOW(), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn mark_success(&self, id: Uuid) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        let current = locked_status(&mut tx, id).await?;
        if !current.can_transition_to(JobStatus::Success) {
            anyhow::bail!("illegal job transition: {id} is {current:?}, cannot become Success");
        }

        sqlx::query(r#"UPDATE jobs SET status = 'success', updated_at = NOW() WHERE id = $1"#)
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, retry_count: i32) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        let current = locked_status(&mut tx, id).await?;
        if !current.can_transition_to(JobStatus::Failed) {
            anyhow::bail!("illegal job transition: {id} is {current:?}, cannot become Failed");
        }

        sqlx::query(
            r#"
            UPDATE jobs SET status = 'failed', retry_count = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(retry_count)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn mark_pending_with_retry(&self, id: Uuid, retry_count: i32) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        let current = locked_status(&mut tx, id).await?;
        if !current.can_transition_to(JobStatus::Pending) {
            anyhow::bail!("illegal job transition: {id} is {current:?}, cannot become Pending");
        }

        sqlx::query(
            r#"
            UPDATE jobs SET status = 'pending', retry_count = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(retry_count)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}

/// Reads a job's current status under `FOR UPDATE`, so the read-check-write
/// sequence in each `mark_*` method above is atomic against a concurrent
/// transition on the same row.
async fn locked_status(tx: &mut sqlx::Transaction<'_, sqlx::Postgres>, id: Uuid) -> anyhow::Result<JobStatus> {
    sqlx::query_scalar("SELECT status FROM jobs WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| anyhow::anyhow!("job {id} not found"))
}

impl JobStatus {
    /// Whether a transition from `self` to `next` is legal under the
    /// `Pending -> Running -> Success|Failed` state machine.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running) | (Running, Success) | (Running, Failed) | (Running, Pending)
        )
    }
}
