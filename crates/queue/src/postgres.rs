//! Postgres broker over the `task_queue` table.
//!
//! Claims use `SELECT ... FOR UPDATE SKIP LOCKED` so concurrent workers
//! never receive the same delivery. Revocations are broadcast with
//! `NOTIFY task_control`.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use sqlx::postgres::PgListener;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::broker::{BrokerError, BrokerResult, RevocationStream, TaskBroker};
use crate::task::{ClaimedTask, QueueName, Revocation, TaskHandle, TaskMessage, TaskState};

/// Notification channel carrying [`Revocation`] JSON payloads.
pub const TASK_CONTROL_CHANNEL: &str = "task_control";

#[derive(FromRow)]
struct ClaimedRow {
    handle: Uuid,
    queue: String,
    task_name: String,
    payload: Json<crate::task::TaskPayload>,
    attempts: i32,
}

#[derive(Clone)]
pub struct PgTaskBroker {
    pool: PgPool,
}

impl PgTaskBroker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskBroker for PgTaskBroker {
    async fn enqueue_as(&self, handle: TaskHandle, queue: &QueueName, message: &TaskMessage) -> BrokerResult<bool> {
        let result = sqlx::query(
            "INSERT INTO task_queue (handle, queue, task_name, payload) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (handle) DO NOTHING",
        )
        .bind(handle.as_uuid())
        .bind(queue.as_str())
        .bind(&message.name)
        .bind(Json(&message.payload))
        .execute(&self.pool)
        .await?;
        let inserted = result.rows_affected() > 0;
        tracing::debug!(task = %handle, queue = %queue, name = %message.name, inserted, "Task enqueued");
        Ok(inserted)
    }

    async fn dequeue(
        &self,
        queues: &[QueueName],
        worker: &str,
        lease: Duration,
    ) -> BrokerResult<Option<ClaimedTask>> {
        let names: Vec<&str> = queues.iter().map(QueueName::as_str).collect();
        let row = sqlx::query_as::<_, ClaimedRow>(
            "UPDATE task_queue \
             SET state = 'claimed', worker = $2, attempts = attempts + 1, \
                 claimed_at = NOW(), lease_expires_at = NOW() + make_interval(secs => $3) \
             WHERE handle = ( \
                 SELECT handle FROM task_queue \
                 WHERE queue = ANY($1) \
                   AND (state = 'queued' OR (state = 'claimed' AND lease_expires_at < NOW())) \
                 ORDER BY enqueued_at \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING handle, queue, task_name, payload, attempts",
        )
        .bind(&names)
        .bind(worker)
        .bind(lease.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| ClaimedTask {
            handle: TaskHandle::from(row.handle),
            queue: QueueName::new(row.queue),
            message: TaskMessage {
                name: row.task_name,
                payload: row.payload.0,
            },
            attempts: row.attempts,
        }))
    }

    async fn renew_lease(&self, handle: TaskHandle, worker: &str, lease: Duration) -> BrokerResult<bool> {
        let result = sqlx::query(
            "UPDATE task_queue SET lease_expires_at = NOW() + make_interval(secs => $3) \
             WHERE handle = $1 AND worker = $2 AND state = 'claimed'",
        )
        .bind(handle.as_uuid())
        .bind(worker)
        .bind(lease.as_secs_f64())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn ack(&self, handle: TaskHandle) -> BrokerResult<()> {
        sqlx::query(
            "UPDATE task_queue SET state = 'done', finished_at = NOW() \
             WHERE handle = $1 AND state = 'claimed'",
        )
        .bind(handle.as_uuid())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn revoke(&self, handle: TaskHandle, terminate: bool) -> BrokerResult<()> {
        let notice = serde_json::to_string(&Revocation { handle, terminate })?;
        sqlx::query(
            "WITH revoked AS ( \
                 UPDATE task_queue SET state = 'revoked', finished_at = NOW() \
                 WHERE handle = $1 AND state IN ('queued', 'claimed') \
             ) \
             SELECT pg_notify($2, $3)",
        )
        .bind(handle.as_uuid())
        .bind(TASK_CONTROL_CHANNEL)
        .bind(notice)
        .execute(&self.pool)
        .await?;
        tracing::info!(task = %handle, terminate, "Task revoked");
        Ok(())
    }

    async fn is_revoked(&self, handle: TaskHandle) -> BrokerResult<bool> {
        let state: Option<String> =
            sqlx::query_scalar("SELECT state FROM task_queue WHERE handle = $1")
                .bind(handle.as_uuid())
                .fetch_optional(&self.pool)
                .await?;
        match state {
            None => Ok(false),
            Some(raw) => TaskState::parse(&raw)
                .map(|s| s == TaskState::Revoked)
                .ok_or(BrokerError::UnknownState(raw)),
        }
    }

    async fn revocations(&self) -> BrokerResult<RevocationStream> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(TASK_CONTROL_CHANNEL).await?;
        let stream = listener.into_stream().filter_map(|notification| async move {
            match notification {
                Ok(notification) => match serde_json::from_str::<Revocation>(notification.payload()) {
                    Ok(revocation) => Some(revocation),
                    Err(e) => {
                        tracing::warn!(error = %e, "Malformed task control notification");
                        None
                    }
                },
                Err(e) => {
                    tracing::warn!(error = %e, "Task control listener error");
                    None
                }
            }
        });
        Ok(stream.boxed())
    }
}
