//! The long-running routine seam.
//!
//! A routine is opaque synchronous work (training or batch inference) run
//! on a blocking thread. It reports through [`TrainingHooks`] at its own
//! iteration boundaries and must call
//! [`check_cancelled`](TrainingHooks::check_cancelled) at the start of every
//! batch and epoch; that is the only point where a stop request is seen.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use spektra_core::job::{Hyperparams, PredictTarget};
use spektra_core::types::{JobId, ProjectId};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoutineError {
    /// A stop request was observed. Not a failure.
    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    Failed(String),
}

/// Progress callbacks driven by the routine.
pub trait TrainingHooks: Send + Sync {
    /// Cooperative cancellation check. Returns [`RoutineError::Cancelled`]
    /// once a stop was requested, so the routine can unwind with `?`.
    fn check_cancelled(&self) -> Result<(), RoutineError>;

    /// End of one batch. `epoch` is 1-based.
    fn on_batch_end(&self, epoch: u32, total_epochs: u32, total_batches: u32);

    /// End of one epoch with that epoch's loss terms.
    fn on_epoch_end(&self, epoch: u32, total_epochs: u32, losses: &BTreeMap<String, f64>);

    /// End of a validation pass.
    fn on_validation_end(&self, metrics: &BTreeMap<String, f64>);

    /// A free-text line from the routine.
    fn log(&self, line: &str);
}

/// Where training weights start from, after resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResolvedCheckpoint {
    /// Pretrained weights for the named architecture.
    Pretrained { architecture: String },
    /// Random initialization for the named architecture.
    Scratch { architecture: String },
    /// A local copy of an earlier training job's weights.
    Weights { path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainRequest {
    pub job_id: JobId,
    pub project_id: ProjectId,
    pub model_architecture: String,
    pub hyperparams: Hyperparams,
    pub checkpoint: ResolvedCheckpoint,
    pub dataset_version_id: Option<uuid::Uuid>,
    /// Directory the dataset export is materialized into.
    pub dataset_dir: PathBuf,
    /// Directory the routine writes its run output into.
    pub output_dir: PathBuf,
}

/// Which model inference runs with, after resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResolvedModel {
    Weights { path: PathBuf },
    Pretrained { architecture: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictRequest {
    pub job_id: JobId,
    pub project_id: ProjectId,
    pub model: ResolvedModel,
    pub target: PredictTarget,
    pub auto_annotate: bool,
    pub output_dir: PathBuf,
}

/// Result of a training run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainOutcome {
    /// Numeric result fields as reported by the routine.
    pub metrics: BTreeMap<String, f64>,
    /// Run directory, where a per-epoch `results.csv` may live.
    pub save_dir: Option<PathBuf>,
    /// Best weights file to keep as the job's artifact.
    pub weights: Option<PathBuf>,
}

/// Result of an inference run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PredictOutcome {
    pub images: u64,
    pub detections: u64,
    pub metrics: BTreeMap<String, f64>,
}

/// Everything a routine gets besides its request.
#[derive(Clone)]
pub struct RoutineContext {
    pub hooks: Arc<dyn TrainingHooks>,
    /// Hard interrupt. Routines that own external resources (child
    /// processes) must release them when this fires.
    pub interrupt: CancellationToken,
    /// Runtime handle for the rare async helper a routine needs.
    pub runtime: Handle,
}

/// The training / inference implementation.
pub trait Routine: Send + Sync + 'static {
    fn train(&self, request: &TrainRequest, ctx: &RoutineContext) -> Result<TrainOutcome, RoutineError>;

    fn predict(&self, request: &PredictRequest, ctx: &RoutineContext) -> Result<PredictOutcome, RoutineError>;
}
