//! Task envelope types and queue routing.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use spektra_core::channel::ChannelName;
use spektra_core::job::{JobParameters, JobType};
use spektra_core::types::{JobId, ProjectId};
use uuid::Uuid;

/// Task name for training executions.
pub const TASK_TRAIN: &str = "train_model";

/// Task name for inference executions.
pub const TASK_PREDICT: &str = "predict_dataset";

// ---------------------------------------------------------------------------
// QueueName
// ---------------------------------------------------------------------------

/// A named queue. Heavy training and lighter inference are routed apart so
/// that workers can be dedicated to either.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueName(String);

impl QueueName {
    pub const TRAIN: &'static str = "train";
    pub const PREDICT: &'static str = "predict";
    pub const DEFAULT: &'static str = "default";

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The queue a job of the given type is routed to.
    pub fn for_job_type(job_type: JobType) -> Self {
        match job_type {
            JobType::Train => Self::new(Self::TRAIN),
            JobType::Predict => Self::new(Self::PREDICT),
        }
    }

    pub fn default_queue() -> Self {
        Self::new(Self::DEFAULT)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse a comma-separated queue list, skipping blanks.
    pub fn parse_list(raw: &str) -> Vec<Self> {
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Self::new)
            .collect()
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// TaskHandle
// ---------------------------------------------------------------------------

/// Opaque reference to one enqueued task, used to revoke it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskHandle(Uuid);

impl TaskHandle {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The handle a job is dispatched under. Every dispatch of one job
    /// names the same task, so a repeated dispatch never queues a second.
    pub fn for_job(job_id: Uuid) -> Self {
        Self(job_id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TaskHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for TaskHandle {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl FromStr for TaskHandle {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Arguments of a job execution task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPayload {
    pub job_id: JobId,
    pub project_id: ProjectId,
    pub channel: ChannelName,
    pub parameters: JobParameters,
}

/// What travels through the broker: a task name plus its payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub name: String,
    pub payload: TaskPayload,
}

impl TaskMessage {
    /// Build the execution task for a job and pick its queue.
    pub fn for_job(
        job_id: JobId,
        project_id: ProjectId,
        parameters: JobParameters,
    ) -> (QueueName, Self) {
        let job_type = parameters.job_type();
        let name = match job_type {
            JobType::Train => TASK_TRAIN,
            JobType::Predict => TASK_PREDICT,
        };
        let message = Self {
            name: name.to_string(),
            payload: TaskPayload {
                job_id,
                project_id,
                channel: ChannelName::for_job(job_id),
                parameters,
            },
        };
        (QueueName::for_job_type(job_type), message)
    }
}

/// A task delivered to a worker.
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub handle: TaskHandle,
    pub queue: QueueName,
    pub message: TaskMessage,
    /// Deliveries so far, this one included.
    pub attempts: i32,
}

/// Broker-side lifecycle of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    Claimed,
    Done,
    Revoked,
}

impl TaskState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Claimed => "claimed",
            Self::Done => "done",
            Self::Revoked => "revoked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "claimed" => Some(Self::Claimed),
            "done" => Some(Self::Done),
            "revoked" => Some(Self::Revoked),
            _ => None,
        }
    }
}

/// Out-of-band stop request for one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revocation {
    pub handle: TaskHandle,
    /// Hard-interrupt the execution, not just skip future deliveries.
    pub terminate: bool,
}

#[cfg(test)]
mod tests {
    use spektra_core::job::{Hyperparams, PredictParams, PredictTarget, TrainParams};

    use super::*;

    #[test]
    fn jobs_route_by_type() {
        let job_id = Uuid::new_v4();
        let train = JobParameters::Train(
            TrainParams::new("yolo11n.pt", Hyperparams::default(), Default::default(), None).unwrap(),
        );
        let (queue, message) = TaskMessage::for_job(job_id, Uuid::new_v4(), train);
        assert_eq!(queue.as_str(), "train");
        assert_eq!(message.name, TASK_TRAIN);
        assert!(message.payload.channel.is_for(job_id));

        let predict = JobParameters::Predict(PredictParams {
            model_path: "models/x.pt".into(),
            target: PredictTarget::Unlabeled { limit: 5 },
            auto_annotate: false,
        });
        let (queue, message) = TaskMessage::for_job(job_id, Uuid::new_v4(), predict);
        assert_eq!(queue.as_str(), "predict");
        assert_eq!(message.name, TASK_PREDICT);
    }

    #[test]
    fn queue_list_parsing_skips_blanks() {
        let queues = QueueName::parse_list(" train, ,predict,");
        assert_eq!(queues, vec![QueueName::new("train"), QueueName::new("predict")]);
    }

    #[test]
    fn message_survives_json() {
        let (_, message) = TaskMessage::for_job(
            Uuid::new_v4(),
            Uuid::new_v4(),
            JobParameters::Predict(PredictParams {
                model_path: "yolo11n.pt".into(),
                target: PredictTarget::Images { image_ids: vec![Uuid::new_v4()] },
                auto_annotate: true,
            }),
        );
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["payload"]["parameters"]["job_type"], "predict");
        let back: TaskMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, message);
    }
}
