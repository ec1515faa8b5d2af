//! The [`TaskBroker`] seam.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::task::{ClaimedTask, QueueName, Revocation, TaskHandle, TaskMessage};

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Broker database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Task payload error: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Unknown task state: {0}")]
    UnknownState(String),
}

pub type BrokerResult<T> = Result<T, BrokerError>;

/// Live feed of revocation requests for every task.
pub type RevocationStream = BoxStream<'static, Revocation>;

#[async_trait]
pub trait TaskBroker: Send + Sync + 'static {
    /// Put a task on `queue` under a fresh handle and return it.
    async fn enqueue(&self, queue: &QueueName, message: &TaskMessage) -> BrokerResult<TaskHandle> {
        let handle = TaskHandle::new();
        self.enqueue_as(handle, queue, message).await?;
        Ok(handle)
    }

    /// Put a task on `queue` under `handle`. A handle that already names a
    /// task, in any state, is left alone and `false` is returned.
    async fn enqueue_as(&self, handle: TaskHandle, queue: &QueueName, message: &TaskMessage) -> BrokerResult<bool>;

    /// Claim the oldest deliverable task on any of `queues` for `lease`.
    ///
    /// Deliverable means queued, or claimed with a lapsed lease.
    async fn dequeue(
        &self,
        queues: &[QueueName],
        worker: &str,
        lease: Duration,
    ) -> BrokerResult<Option<ClaimedTask>>;

    /// Extend a held lease. `false` if the task is no longer held by `worker`.
    async fn renew_lease(&self, handle: TaskHandle, worker: &str, lease: Duration) -> BrokerResult<bool>;

    /// Mark a claimed task finished.
    async fn ack(&self, handle: TaskHandle) -> BrokerResult<()>;

    /// Stop a task: it is never delivered again, and subscribers of
    /// [`revocations`](Self::revocations) are told to interrupt it when
    /// `terminate` is set.
    async fn revoke(&self, handle: TaskHandle, terminate: bool) -> BrokerResult<()>;

    async fn is_revoked(&self, handle: TaskHandle) -> BrokerResult<bool>;

    /// Subscribe to revocation requests published after this call.
    async fn revocations(&self) -> BrokerResult<RevocationStream>;
}
