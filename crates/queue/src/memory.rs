//! In-process broker with the same claim, lease and revocation rules as
//! the Postgres broker.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;

use crate::broker::{BrokerResult, RevocationStream, TaskBroker};
use crate::task::{ClaimedTask, QueueName, Revocation, TaskHandle, TaskMessage, TaskState};

struct Entry {
    seq: u64,
    queue: QueueName,
    message: TaskMessage,
    state: TaskState,
    worker: Option<String>,
    lease_expires: Option<Instant>,
    attempts: i32,
}

impl Entry {
    fn deliverable(&self, now: Instant) -> bool {
        match self.state {
            TaskState::Queued => true,
            TaskState::Claimed => self.lease_expires.is_some_and(|at| at <= now),
            TaskState::Done | TaskState::Revoked => false,
        }
    }
}

#[derive(Default)]
struct State {
    next_seq: u64,
    tasks: HashMap<TaskHandle, Entry>,
}

pub struct MemoryTaskBroker {
    state: Mutex<State>,
    revocations: broadcast::Sender<Revocation>,
}

impl Default for MemoryTaskBroker {
    fn default() -> Self {
        let (revocations, _) = broadcast::channel(256);
        Self {
            state: Mutex::new(State::default()),
            revocations,
        }
    }
}

impl MemoryTaskBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current broker-side state of a task.
    pub fn state_of(&self, handle: TaskHandle) -> Option<TaskState> {
        self.lock().tasks.get(&handle).map(|entry| entry.state)
    }

    /// Tasks still waiting for a first delivery on `queue`.
    pub fn queued_len(&self, queue: &QueueName) -> usize {
        self.lock()
            .tasks
            .values()
            .filter(|entry| &entry.queue == queue && entry.state == TaskState::Queued)
            .count()
    }
}

#[async_trait]
impl TaskBroker for MemoryTaskBroker {
    async fn enqueue_as(&self, handle: TaskHandle, queue: &QueueName, message: &TaskMessage) -> BrokerResult<bool> {
        let mut state = self.lock();
        if state.tasks.contains_key(&handle) {
            return Ok(false);
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.tasks.insert(
            handle,
            Entry {
                seq,
                queue: queue.clone(),
                message: message.clone(),
                state: TaskState::Queued,
                worker: None,
                lease_expires: None,
                attempts: 0,
            },
        );
        Ok(true)
    }

    async fn dequeue(
        &self,
        queues: &[QueueName],
        worker: &str,
        lease: Duration,
    ) -> BrokerResult<Option<ClaimedTask>> {
        let now = Instant::now();
        let mut state = self.lock();
        let next = state
            .tasks
            .iter()
            .filter(|(_, entry)| queues.contains(&entry.queue) && entry.deliverable(now))
            .min_by_key(|(_, entry)| entry.seq)
            .map(|(handle, _)| *handle);

        let Some(handle) = next else {
            return Ok(None);
        };
        let Some(entry) = state.tasks.get_mut(&handle) else {
            return Ok(None);
        };
        entry.state = TaskState::Claimed;
        entry.worker = Some(worker.to_string());
        entry.lease_expires = Some(now + lease);
        entry.attempts += 1;
        Ok(Some(ClaimedTask {
            handle,
            queue: entry.queue.clone(),
            message: entry.message.clone(),
            attempts: entry.attempts,
        }))
    }

    async fn renew_lease(&self, handle: TaskHandle, worker: &str, lease: Duration) -> BrokerResult<bool> {
        let mut state = self.lock();
        match state.tasks.get_mut(&handle) {
            Some(entry)
                if entry.state == TaskState::Claimed && entry.worker.as_deref() == Some(worker) =>
            {
                entry.lease_expires = Some(Instant::now() + lease);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ack(&self, handle: TaskHandle) -> BrokerResult<()> {
        if let Some(entry) = self.lock().tasks.get_mut(&handle) {
            if entry.state == TaskState::Claimed {
                entry.state = TaskState::Done;
            }
        }
        Ok(())
    }

    async fn revoke(&self, handle: TaskHandle, terminate: bool) -> BrokerResult<()> {
        if let Some(entry) = self.lock().tasks.get_mut(&handle) {
            if matches!(entry.state, TaskState::Queued | TaskState::Claimed) {
                entry.state = TaskState::Revoked;
            }
        }
        // No listeners is fine.
        let _ = self.revocations.send(Revocation { handle, terminate });
        Ok(())
    }

    async fn is_revoked(&self, handle: TaskHandle) -> BrokerResult<bool> {
        Ok(self.state_of(handle) == Some(TaskState::Revoked))
    }

    async fn revocations(&self) -> BrokerResult<RevocationStream> {
        let stream = BroadcastStream::new(self.revocations.subscribe())
            .filter_map(|item| async move { item.ok() });
        Ok(stream.boxed())
    }
}
