#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use spektra_core::job::{CheckpointSelector, Hyperparams, JobParameters, TrainParams};
use spektra_db::models::job::{Job, NewJob};
use spektra_db::store::{JobStore, MemoryJobStore};
use spektra_queue::{TaskMessage, TaskPayload};
use spektra_telemetry::TelemetryChannel;
use spektra_worker::artifact::LocalArtifactStore;
use spektra_worker::inputs::LocalInputResolver;
use spektra_worker::routine::{
    PredictOutcome, PredictRequest, Routine, RoutineContext, RoutineError, TrainOutcome, TrainRequest,
};
use spektra_worker::{Executor, ExecutorSettings};
use tempfile::TempDir;
use uuid::Uuid;

type TrainFn = dyn Fn(&TrainRequest, &RoutineContext) -> Result<TrainOutcome, RoutineError> + Send + Sync;
type PredictFn = dyn Fn(&PredictRequest, &RoutineContext) -> Result<PredictOutcome, RoutineError> + Send + Sync;

/// A routine whose behavior is supplied by the test.
pub struct ScriptedRoutine {
    train: Box<TrainFn>,
    predict: Box<PredictFn>,
}

impl ScriptedRoutine {
    pub fn train<F>(f: F) -> Self
    where
        F: Fn(&TrainRequest, &RoutineContext) -> Result<TrainOutcome, RoutineError> + Send + Sync + 'static,
    {
        Self {
            train: Box::new(f),
            predict: Box::new(|_, _| Err(RoutineError::Failed("predict not scripted".into()))),
        }
    }

    pub fn predict<F>(f: F) -> Self
    where
        F: Fn(&PredictRequest, &RoutineContext) -> Result<PredictOutcome, RoutineError> + Send + Sync + 'static,
    {
        Self {
            train: Box::new(|_, _| Err(RoutineError::Failed("train not scripted".into()))),
            predict: Box::new(f),
        }
    }
}

impl Routine for ScriptedRoutine {
    fn train(&self, request: &TrainRequest, ctx: &RoutineContext) -> Result<TrainOutcome, RoutineError> {
        (self.train)(request, ctx)
    }

    fn predict(&self, request: &PredictRequest, ctx: &RoutineContext) -> Result<PredictOutcome, RoutineError> {
        (self.predict)(request, ctx)
    }
}

/// Write a weights file into the request's output directory.
pub fn write_weights(request: &TrainRequest) -> PathBuf {
    let path = request.output_dir.join("best.pt");
    std::fs::write(&path, b"weights").unwrap();
    path
}

/// Train `epochs` epochs of `batches` batches each, checking for
/// cancellation at every boundary.
pub fn run_epochs(ctx: &RoutineContext, epochs: u32, batches: u32) -> Result<(), RoutineError> {
    for epoch in 1..=epochs {
        ctx.hooks.check_cancelled()?;
        for _ in 0..batches {
            ctx.hooks.check_cancelled()?;
            ctx.hooks.on_batch_end(epoch, epochs, batches);
        }
        let losses = BTreeMap::from([("box_loss".to_string(), 1.0 / f64::from(epoch))]);
        ctx.hooks.on_epoch_end(epoch, epochs, &losses);
    }
    Ok(())
}

pub struct Harness {
    pub store: Arc<MemoryJobStore>,
    pub telemetry: TelemetryChannel,
    pub artifacts: Arc<LocalArtifactStore>,
    pub executor: Arc<Executor>,
    pub dir: TempDir,
}

impl Harness {
    pub fn new(routine: ScriptedRoutine) -> Self {
        Self::with_store(routine, |store| store as Arc<dyn JobStore>)
    }

    /// Like [`Harness::new`], with the executor writing through the store
    /// returned by `wrap`. `store` still reads the underlying records.
    pub fn with_store<F>(routine: ScriptedRoutine, wrap: F) -> Self
    where
        F: FnOnce(Arc<MemoryJobStore>) -> Arc<dyn JobStore>,
    {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryJobStore::new());
        let telemetry = TelemetryChannel::in_memory();
        let artifacts = Arc::new(LocalArtifactStore::new(dir.path().join("artifacts")));
        let executor = Arc::new(Executor::new(
            wrap(store.clone()),
            telemetry.clone(),
            artifacts.clone(),
            Arc::new(LocalInputResolver::new(artifacts.clone())),
            Arc::new(routine),
            ExecutorSettings {
                progress_every_batches: 2,
                progress_tick_batches: 1,
                scratch_root: Some(dir.path().join("scratch")),
            },
        ));
        Self {
            store,
            telemetry,
            artifacts,
            executor,
            dir,
        }
    }

    /// Persist a PENDING job and build the task payload for it.
    pub async fn submit(&self, parameters: JobParameters) -> TaskPayload {
        let job = self.store.create(&NewJob::new(Uuid::new_v4(), parameters)).await.unwrap();
        let (_, message) = TaskMessage::for_job(job.id, job.project_id, job.parameters.0.clone());
        message.payload
    }

    pub async fn job(&self, payload: &TaskPayload) -> Job {
        self.store.find(payload.job_id).await.unwrap().unwrap()
    }

    /// Entries left in the scratch root.
    pub fn scratch_entries(&self) -> usize {
        std::fs::read_dir(self.dir.path().join("scratch"))
            .map(|dir| dir.count())
            .unwrap_or(0)
    }
}

pub fn train_params(epochs: u32) -> JobParameters {
    train_params_from(epochs, CheckpointSelector::Coco)
}

pub fn train_params_from(epochs: u32, checkpoint: CheckpointSelector) -> JobParameters {
    let hyperparams = Hyperparams {
        epochs,
        ..Hyperparams::default()
    };
    JobParameters::Train(TrainParams::new("yolo11n.pt", hyperparams, checkpoint, None).unwrap())
}

pub fn log_lines(job: &Job) -> Vec<String> {
    job.logs.0.iter().map(|entry| entry.line.clone()).collect()
}
