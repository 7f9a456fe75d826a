//! AMQP queue adapter (`lapin`). Declares the `ticker_updates` queue and its
//! `ticker_updates_dlq` companion, both durable with persistent messages,
//! and exposes publish/ack/nack primitives the scheduler drives its
//! at-least-once delivery loop through.
//!
//! The `JobQueue` trait is the seam the scheduler actually depends on, so
//! its gating/orchestration logic can be exercised against an in-memory
//! fake without a live broker (see `ticker-worker/tests/`).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

pub const PRIMARY_QUEUE: &str = "ticker_updates";
pub const DLQ: &str = "ticker_updates_dlq";

/// The wire shape of a queue message, matching the external interface
/// exactly: `job_id`, `ticker_list`, `execution_time`, `retry_count`,
/// `created_at`, `updated_at`. Distinct from the `ticker_core::Job` audit
/// row, which is keyed by database column names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMessage {
    pub job_id: Uuid,
    pub ticker_list: Vec<String>,
    pub execution_time: DateTime<Utc>,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobMessage {
    pub fn first_run(symbols: Vec<String>, execution_time: DateTime<Utc>) -> Self {
        let now = Utc::now();
        Self {
            job_id: Uuid::new_v4(),
            ticker_list: symbols,
            execution_time,
            retry_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn next_run(&self, execution_time: DateTime<Utc>) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            ticker_list: self.ticker_list.clone(),
            execution_time,
            retry_count: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    pub fn with_incremented_retry(&self) -> Self {
        let mut next = self.clone();
        next.retry_count += 1;
        next.updated_at = Utc::now();
        next
    }
}

/// The acknowledgement half of a received delivery, kept separate from the
/// decoded `JobMessage` so a fake queue can hand out a cheap handle without
/// modelling a real broker's wire protocol.
#[async_trait]
pub trait DeliveryHandle: Send + Sync {
    async fn ack(self: Box<Self>) -> Result<()>;

    /// Negative-acknowledge with requeue: used for retryable failures and
    /// for the short cooperative-poll delay while waiting for
    /// `execution_time`.
    async fn nack_requeue(self: Box<Self>) -> Result<()>;

    /// Drop the original delivery without requeueing, paired with an
    /// explicit `publish_to_dlq` of the (possibly retry-incremented)
    /// message.
    async fn drop_without_requeue(self: Box<Self>) -> Result<()>;
}

/// A delivery received from the queue: the decoded message plus the handle
/// needed to ack/nack it.
pub struct Delivery {
    pub message: JobMessage,
    pub handle: Box<dyn DeliveryHandle>,
}

impl Delivery {
    pub async fn ack(self) -> Result<()> {
        self.handle.ack().await
    }

    pub async fn nack_requeue(self) -> Result<()> {
        self.handle.nack_requeue().await
    }

    pub async fn drop_without_requeue(self) -> Result<()> {
        self.handle.drop_without_requeue().await
    }
}

/// Everything the scheduler needs from a message broker: receive the next
/// due delivery, and publish to the primary or dead-letter queue.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn next_delivery(&self) -> Option<Delivery>;
    async fn publish(&self, message: &JobMessage) -> Result<()>;
    async fn publish_to_dlq(&self, message: &JobMessage) -> Result<()>;
    fn is_connected(&self) -> bool;
    async fn close(&self) -> Result<()>;
}

struct AmqpDeliveryHandle {
    raw: lapin::message::Delivery,
}

#[async_trait]
impl DeliveryHandle for AmqpDeliveryHandle {
    async fn ack(self: Box<Self>) -> Result<()> {
        self.raw.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn nack_requeue(self: Box<Self>) -> Result<()> {
        self.raw
            .nack(BasicNackOptions {
                requeue: true,
                ..BasicNackOptions::default()
            })
            .await?;
        Ok(())
    }

    async fn drop_without_requeue(self: Box<Self>) -> Result<()> {
        self.raw
            .nack(BasicNackOptions {
                requeue: false,
                ..BasicNackOptions::default()
            })
            .await?;
        Ok(())
    }
}

/// Thin wrapper over a `lapin` connection/channel pair. `is_connected` backs
/// the health probe's queue check.
pub struct AmqpQueue {
    connection: Connection,
    channel: Channel,
    connected: AtomicBool,
    consumer: Mutex<lapin::Consumer>,
}

impl AmqpQueue {
    pub async fn connect(queue_url: &str) -> Result<Self> {
        let connection = Connection::connect(queue_url, ConnectionProperties::default())
            .await
            .context("failed to connect to broker")?;
        let channel = connection
            .create_channel()
            .await
            .context("failed to open AMQP channel")?;

        declare_durable_queue(&channel, PRIMARY_QUEUE).await?;
        declare_durable_queue(&channel, DLQ).await?;

        let consumer = channel
            .basic_consume(
                PRIMARY_QUEUE,
                "ticker-scheduler",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .context("failed to start consuming ticker_updates")?;

        info!(queue = PRIMARY_QUEUE, dlq = DLQ, "connected to broker");

        Ok(Self {
            connection,
            channel,
            connected: AtomicBool::new(true),
            consumer: Mutex::new(consumer),
        })
    }

    async fn publish_to(&self, queue: &str, message: &JobMessage) -> Result<()> {
        let body = serde_json::to_vec(message)?;
        self.channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                &body,
                BasicProperties::default().with_delivery_mode(2),
            )
            .await?
            .await?;
        Ok(())
    }
}

#[async_trait]
impl JobQueue for AmqpQueue {
    async fn next_delivery(&self) -> Option<Delivery> {
        let mut consumer = self.consumer.lock().await;
        match consumer.next().await {
            Some(Ok(raw)) => match serde_json::from_slice::<JobMessage>(&raw.data) {
                Ok(message) => Some(Delivery {
                    message,
                    handle: Box::new(AmqpDeliveryHandle { raw }),
                }),
                Err(e) => {
                    warn!(error = %e, "failed to decode queue message; acking to drop poison message");
                    let _ = raw.ack(BasicAckOptions::default()).await;
                    None
                }
            },
            Some(Err(e)) => {
                warn!(error = %e, "error receiving delivery from broker");
                None
            }
            None => None,
        }
    }

    async fn publish(&self, message: &JobMessage) -> Result<()> {
        self.publish_to(PRIMARY_QUEUE, message).await
    }

    async fn publish_to_dlq(&self, message: &JobMessage) -> Result<()> {
        self.publish_to(DLQ, message).await
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed) && self.connection.status().connected()
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::Relaxed);
        self.channel.close(200, "shutting down").await?;
        self.connection.close(200, "shutting down").await?;
        Ok(())
    }
}

async fn declare_durable_queue(channel: &Channel, name: &str) -> Result<()> {
    channel
        .queue_declare(
            name,
            QueueDeclareOptions {
                durable: true,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .with_context(|| format!("failed to declare queue {name}"))?;
    Ok(())
}
