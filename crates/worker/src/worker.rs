//! The worker loop.
//!
//! Claims tasks from the broker up to the configured concurrency, runs each
//! through the [`Executor`] while renewing its lease, and routes revocation
//! notices to the matching execution's stop signals.
//!
//! A task holds at most one execution per worker: a claim of a handle that
//! is already running here means its lease lapsed between renewals, and the
//! claim is dropped. An execution whose lease renewal is refused is
//! abandoned and its task is never acknowledged.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::StreamExt;
use spektra_queue::{BrokerResult, ClaimedTask, QueueName, RevocationStream, TaskBroker, TaskHandle};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::executor::{ExecutionControl, ExecutionOutcome, Executor};

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub queues: Vec<QueueName>,
    pub concurrency: usize,
    pub poll_interval: Duration,
    /// Claim lease. Renewed every third of its length while running.
    pub lease: Duration,
    /// How long running executions may take to finish after shutdown
    /// starts before they are interrupted.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            queues: vec![
                QueueName::new(QueueName::TRAIN),
                QueueName::new(QueueName::PREDICT),
                QueueName::default_queue(),
            ],
            concurrency: 1,
            poll_interval: Duration::from_secs(1),
            lease: Duration::from_secs(120),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

type ActiveMap = Arc<Mutex<HashMap<TaskHandle, ExecutionControl>>>;

fn lock(active: &ActiveMap) -> MutexGuard<'_, HashMap<TaskHandle, ExecutionControl>> {
    active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Removes an execution from the active map when its task ends, panics
/// included.
struct ActiveGuard {
    active: ActiveMap,
    handle: TaskHandle,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        lock(&self.active).remove(&self.handle);
    }
}

pub struct Worker {
    broker: Arc<dyn TaskBroker>,
    executor: Arc<Executor>,
    settings: WorkerSettings,
    worker_id: String,
    active: ActiveMap,
}

impl Worker {
    pub fn new(broker: Arc<dyn TaskBroker>, executor: Arc<Executor>, settings: WorkerSettings) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self {
            broker,
            executor,
            worker_id: format!("worker-{}-{}", std::process::id(), &suffix[..8]),
            settings,
            active: Arc::default(),
        }
    }

    /// Identity recorded on claimed tasks.
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Number of executions currently running.
    pub fn active_count(&self) -> usize {
        lock(&self.active).len()
    }

    /// Run until `shutdown` fires and every execution has stopped.
    pub async fn run(&self, shutdown: CancellationToken) -> BrokerResult<()> {
        let revocations = self.broker.revocations().await?;
        let listener = tokio::spawn(watch_revocations(revocations, Arc::clone(&self.active)));

        let concurrency = self.settings.concurrency.max(1);
        let mut running = JoinSet::new();
        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            worker_id = %self.worker_id,
            queues = ?self.settings.queues.iter().map(QueueName::as_str).collect::<Vec<_>>(),
            concurrency,
            "Worker started",
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(joined) = running.join_next(), if !running.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "Execution task aborted");
                    }
                }
                _ = ticker.tick(), if running.len() < concurrency => {
                    while running.len() < concurrency {
                        match self
                            .broker
                            .dequeue(&self.settings.queues, &self.worker_id, self.settings.lease)
                            .await
                        {
                            Ok(Some(task)) => self.start(task, &mut running),
                            Ok(None) => break,
                            Err(e) => {
                                tracing::error!(error = %e, "Failed to claim task");
                                break;
                            }
                        }
                    }
                }
            }
        }

        self.drain(&mut running).await;
        listener.abort();
        tracing::info!(worker_id = %self.worker_id, "Worker stopped");
        Ok(())
    }

    fn start(&self, task: ClaimedTask, running: &mut JoinSet<()>) {
        let control = ExecutionControl::new();
        {
            let mut active = lock(&self.active);
            if active.contains_key(&task.handle) {
                tracing::warn!(
                    task = %task.handle,
                    job_id = %task.message.payload.job_id,
                    "Task reclaimed while still running here, ignoring the duplicate claim",
                );
                return;
            }
            active.insert(task.handle, control.clone());
        }
        let guard = ActiveGuard {
            active: Arc::clone(&self.active),
            handle: task.handle,
        };

        tracing::info!(
            task = %task.handle,
            job_id = %task.message.payload.job_id,
            queue = %task.queue,
            attempt = task.attempts,
            "Task claimed",
        );

        let run = TaskRun {
            broker: Arc::clone(&self.broker),
            executor: Arc::clone(&self.executor),
            worker_id: self.worker_id.clone(),
            lease: self.settings.lease,
        };
        running.spawn(async move {
            let _guard = guard;
            run.process(task, control).await;
        });
    }

    /// Stop claiming, give running executions `shutdown_timeout` to finish,
    /// then interrupt whatever is left.
    async fn drain(&self, running: &mut JoinSet<()>) {
        if running.is_empty() {
            return;
        }
        tracing::info!(running = running.len(), "Waiting for running executions");

        if tokio::time::timeout(self.settings.shutdown_timeout, wait_all(running))
            .await
            .is_ok()
        {
            return;
        }

        tracing::warn!(running = running.len(), "Shutdown timeout reached, interrupting executions");
        for control in lock(&self.active).values() {
            control.stop(true);
        }
        if tokio::time::timeout(self.settings.shutdown_timeout, wait_all(running))
            .await
            .is_err()
        {
            tracing::error!(running = running.len(), "Executions did not stop, aborting");
            running.abort_all();
        }
    }
}

async fn wait_all(running: &mut JoinSet<()>) {
    while running.join_next().await.is_some() {}
}

/// What one spawned execution task needs.
struct TaskRun {
    broker: Arc<dyn TaskBroker>,
    executor: Arc<Executor>,
    worker_id: String,
    lease: Duration,
}

impl TaskRun {
    async fn process(self, task: ClaimedTask, control: ExecutionControl) {
        let handle = task.handle;
        let payload = &task.message.payload;

        match self.broker.is_revoked(handle).await {
            Ok(true) => {
                tracing::info!(task = %handle, "Task revoked before start");
                control.stop(false);
            }
            Ok(false) => {}
            Err(e) => tracing::warn!(task = %handle, error = %e, "Failed to check revocation"),
        }

        let execution = self.executor.execute(payload, control.clone());
        tokio::pin!(execution);
        let renewal = self.renew_lease(handle, &control);
        tokio::pin!(renewal);
        let mut lease_lost = false;

        let result = loop {
            tokio::select! {
                result = &mut execution => break result,
                _ = &mut renewal, if !lease_lost => lease_lost = true,
            }
        };

        if lease_lost {
            tracing::warn!(
                task = %handle,
                job_id = %payload.job_id,
                outcome = ?result.as_ref().ok(),
                "Abandoned execution finished, task left to its new owner",
            );
            return;
        }

        match result {
            Ok(outcome) => {
                if let Err(e) = self.broker.ack(handle).await {
                    tracing::warn!(task = %handle, error = %e, "Failed to acknowledge task");
                }
                match outcome {
                    ExecutionOutcome::Skipped => {
                        tracing::info!(task = %handle, job_id = %payload.job_id, "Redelivered task skipped")
                    }
                    outcome => {
                        tracing::info!(task = %handle, job_id = %payload.job_id, outcome = ?outcome, "Task finished")
                    }
                }
            }
            Err(e) => {
                // Left unacknowledged: the lease lapses and the task is redelivered.
                tracing::error!(task = %handle, job_id = %payload.job_id, error = %e, "Execution failed to finalize");
            }
        }
    }

    /// Renew the lease until it is lost, then abandon the execution. Never
    /// returns while renewals succeed.
    async fn renew_lease(&self, handle: TaskHandle, control: &ExecutionControl) {
        let period = (self.lease / 3).max(Duration::from_millis(100));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match self.broker.renew_lease(handle, &self.worker_id, self.lease).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!(task = %handle, "Task lease lost, abandoning execution");
                    control.abandon();
                    return;
                }
                Err(e) => tracing::warn!(task = %handle, error = %e, "Failed to renew task lease"),
            }
        }
    }
}

async fn watch_revocations(mut revocations: RevocationStream, active: ActiveMap) {
    while let Some(revocation) = revocations.next().await {
        if let Some(control) = lock(&active).get(&revocation.handle) {
            tracing::info!(
                task = %revocation.handle,
                terminate = revocation.terminate,
                "Stopping revoked execution",
            );
            control.stop(revocation.terminate);
        }
    }
    tracing::warn!("Revocation feed closed");
}
