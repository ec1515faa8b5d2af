//! Postgres telemetry backend.
//!
//! Live frames travel over `NOTIFY` on the channel name itself. The log
//! buffer and progress slot are TTL-stamped rows; reads ignore expired rows
//! and the sweeper deletes them.
//!
//! One `PgListener` per process serves every subscription: the first local
//! subscriber of a channel issues `LISTEN`, the last one to leave issues
//! `UNLISTEN`.
//!
//! # Delivery guarantees
//!
//! - Frames published before `LISTEN` completes are not delivered live.
//! - Frames may be lost while the listener reconnects.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use spektra_core::channel::ChannelName;
use spektra_core::progress::Progress;
use spektra_core::telemetry::{encode_progress, LogEntry};
use sqlx::postgres::PgListener;
use sqlx::types::Json;
use sqlx::PgPool;
use tokio::sync::{mpsc, oneshot};

use crate::fanout::FanOut;
use crate::subscription::Subscription;
use crate::{TelemetryBackend, TelemetryError, TelemetryResult, TelemetryTtl};

/// `pg_notify` rejects payloads of 8000 bytes or more.
const MAX_NOTIFY_PAYLOAD: usize = 7900;

/// Pause before polling the listener again after an error.
const LISTENER_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Append to the buffer, upsert the progress slot and notify, as one
/// statement.
const PUBLISH_SQL: &str = "\
    WITH appended AS ( \
        INSERT INTO telemetry_log_entries (channel, logged_at, line, expires_at) \
        SELECT $1, $2, $3, NOW() + make_interval(secs => $4) \
        WHERE $3::text IS NOT NULL \
    ), cached AS ( \
        INSERT INTO telemetry_progress (channel, payload, updated_at, expires_at) \
        SELECT $1, $5::jsonb, NOW(), NOW() + make_interval(secs => $6) \
        WHERE $5::jsonb IS NOT NULL \
        ON CONFLICT (channel) DO UPDATE \
        SET payload = EXCLUDED.payload, \
            updated_at = EXCLUDED.updated_at, \
            expires_at = EXCLUDED.expires_at \
    ) \
    SELECT pg_notify($1, frame) FROM unnest($7::text[]) WITH ORDINALITY AS f(frame, ord)";

enum ListenerCommand {
    Listen(String, oneshot::Sender<Result<(), sqlx::Error>>),
    Unlisten(String),
}

pub struct PgTelemetryBackend {
    pool: PgPool,
    ttl: TelemetryTtl,
    fanout: Arc<FanOut>,
    commands: mpsc::UnboundedSender<ListenerCommand>,
}

impl PgTelemetryBackend {
    /// Open the shared listener connection and start its dispatch task.
    pub async fn connect(pool: PgPool, ttl: TelemetryTtl) -> TelemetryResult<Self> {
        let listener = PgListener::connect_with(&pool).await?;
        let fanout = Arc::new(FanOut::default());
        let (commands, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_listener(listener, rx, Arc::clone(&fanout)));
        Ok(Self {
            pool,
            ttl,
            fanout,
            commands,
        })
    }

    async fn execute_publish(
        &self,
        channel: &ChannelName,
        entry: Option<&LogEntry>,
        progress: Option<&Progress>,
    ) -> TelemetryResult<()> {
        let mut frames = Vec::with_capacity(2);
        if let Some(entry) = entry {
            frames.push(truncate_frame(&entry.line).to_string());
        }
        if let Some(progress) = progress {
            frames.push(encode_progress(progress));
        }

        sqlx::query(PUBLISH_SQL)
            .bind(channel.as_str())
            .bind(entry.map(|e| e.timestamp))
            .bind(entry.map(|e| e.line.as_str()))
            .bind(self.ttl.log.as_secs_f64())
            .bind(progress.map(Json))
            .bind(self.ttl.progress.as_secs_f64())
            .bind(frames)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl TelemetryBackend for PgTelemetryBackend {
    async fn publish(
        &self,
        channel: &ChannelName,
        entry: &LogEntry,
        progress: Option<&Progress>,
    ) -> TelemetryResult<()> {
        self.execute_publish(channel, Some(entry), progress).await
    }

    async fn publish_progress(&self, channel: &ChannelName, progress: &Progress) -> TelemetryResult<()> {
        self.execute_publish(channel, None, Some(progress)).await
    }

    async fn drain(&self, channel: &ChannelName) -> TelemetryResult<Vec<LogEntry>> {
        let rows = sqlx::query_as::<_, (DateTime<Utc>, String)>(
            "SELECT logged_at, line FROM telemetry_log_entries \
             WHERE channel = $1 AND expires_at > NOW() \
             ORDER BY id",
        )
        .bind(channel.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(timestamp, line)| LogEntry { timestamp, line })
            .collect())
    }

    async fn latest_progress(&self, channel: &ChannelName) -> TelemetryResult<Option<Progress>> {
        let row = sqlx::query_scalar::<_, Json<Progress>>(
            "SELECT payload FROM telemetry_progress \
             WHERE channel = $1 AND expires_at > NOW()",
        )
        .bind(channel.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|Json(progress)| progress))
    }

    async fn clear(&self, channel: &ChannelName) -> TelemetryResult<()> {
        sqlx::query("DELETE FROM telemetry_log_entries WHERE channel = $1")
            .bind(channel.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &ChannelName) -> TelemetryResult<Subscription> {
        let mut pending = None;
        let receiver = self.fanout.join(channel.as_str(), |name| {
            let (ack, wait) = oneshot::channel();
            if self
                .commands
                .send(ListenerCommand::Listen(name.to_string(), ack))
                .is_ok()
            {
                pending = Some(wait);
            }
        });

        let fanout = Arc::clone(&self.fanout);
        let commands = self.commands.clone();
        let name = channel.to_string();
        let subscription = Subscription::new(channel.clone(), receiver, move || {
            fanout.leave(&name, |name| {
                let _ = commands.send(ListenerCommand::Unlisten(name.to_string()));
            });
        });

        if let Some(wait) = pending {
            // Dropping `subscription` on error releases the fan-out slot.
            wait.await.map_err(|_| TelemetryError::ListenerClosed)??;
        } else if self.commands.is_closed() {
            return Err(TelemetryError::ListenerClosed);
        }
        Ok(subscription)
    }

    async fn sweep_expired(&self) -> TelemetryResult<u64> {
        let logs = sqlx::query("DELETE FROM telemetry_log_entries WHERE expires_at <= NOW()")
            .execute(&self.pool)
            .await?;
        let progress = sqlx::query("DELETE FROM telemetry_progress WHERE expires_at <= NOW()")
            .execute(&self.pool)
            .await?;
        Ok(logs.rows_affected() + progress.rows_affected())
    }
}

/// Dispatch notifications into the fan-out and apply LISTEN/UNLISTEN
/// requests until the backend is dropped.
async fn run_listener(
    mut listener: PgListener,
    mut commands: mpsc::UnboundedReceiver<ListenerCommand>,
    fanout: Arc<FanOut>,
) {
    tracing::debug!("Telemetry listener started");
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(ListenerCommand::Listen(channel, ack)) => {
                    let _ = ack.send(listener.listen(&channel).await);
                }
                Some(ListenerCommand::Unlisten(channel)) => {
                    if let Err(e) = listener.unlisten(&channel).await {
                        tracing::warn!(channel = %channel, error = %e, "UNLISTEN failed");
                    }
                }
                None => break,
            },
            notification = listener.recv() => match notification {
                Ok(notification) => {
                    fanout.send(notification.channel(), notification.payload().to_string());
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Telemetry listener error, retrying");
                    tokio::time::sleep(LISTENER_RETRY_DELAY).await;
                }
            },
        }
    }
    tracing::debug!("Telemetry listener stopped");
}

/// Cut a frame to fit in a notification, on a char boundary.
fn truncate_frame(line: &str) -> &str {
    if line.len() <= MAX_NOTIFY_PAYLOAD {
        return line;
    }
    let mut end = MAX_NOTIFY_PAYLOAD;
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    &line[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_frames_are_untouched() {
        assert_eq!(truncate_frame("Epoch 1/3"), "Epoch 1/3");
    }

    #[test]
    fn long_frames_are_cut_on_char_boundary() {
        let line = "é".repeat(MAX_NOTIFY_PAYLOAD);
        let cut = truncate_frame(&line);
        assert!(cut.len() <= MAX_NOTIFY_PAYLOAD);
        assert!(cut.chars().all(|c| c == 'é'));
    }
}
