//! [`CommandRoutine`]: the routine as an external command.
//!
//! The command receives `--request <path>` pointing at a JSON request file
//! and reports on stdout with one JSON object per line:
//!
//! ```text
//! {"event":"batch_end","epoch":1,"total_epochs":3,"total_batches":40}
//! {"event":"epoch_end","epoch":1,"total_epochs":3,"losses":{"box_loss":1.2}}
//! {"event":"val_end","metrics":{"mAP50":0.41}}
//! {"event":"log","line":"..."}
//! {"event":"result","metrics":{...},"save_dir":"...","weights":".../best.pt"}
//! ```
//!
//! Any other stdout line is forwarded as a log line. The child runs under
//! tokio: a supervisor task waits for it to exit and kills it when the hard
//! interrupt fires, and a reader task forwards its stdout to the routine
//! thread, which checks the cooperative stop flag before every event.

use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::routine::{
    PredictOutcome, PredictRequest, Routine, RoutineContext, RoutineError, TrainOutcome, TrainRequest,
};

/// Request file written next to the routine's output.
pub const REQUEST_FILE: &str = "request.json";

/// Stderr lines kept for the failure message.
const STDERR_TAIL_LINES: usize = 20;

/// Stdout lines buffered between the reader task and the routine thread.
const LINE_BUFFER: usize = 256;

/// How long to wait for stderr to reach EOF once the child is gone.
const STDERR_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum RoutineEvent {
    BatchEnd {
        epoch: u32,
        total_epochs: u32,
        total_batches: u32,
    },
    EpochEnd {
        epoch: u32,
        total_epochs: u32,
        #[serde(default)]
        losses: BTreeMap<String, f64>,
    },
    ValEnd {
        #[serde(default)]
        metrics: BTreeMap<String, f64>,
    },
    Log {
        line: String,
    },
    Result(RoutineResult),
}

#[derive(Debug, Default, Deserialize)]
struct RoutineResult {
    #[serde(default)]
    metrics: BTreeMap<String, f64>,
    save_dir: Option<PathBuf>,
    weights: Option<PathBuf>,
    #[serde(default)]
    images: u64,
    #[serde(default)]
    detections: u64,
}

pub struct CommandRoutine {
    train_command: Vec<String>,
    predict_command: Vec<String>,
}

impl CommandRoutine {
    pub fn new(train_command: Vec<String>, predict_command: Vec<String>) -> Self {
        Self {
            train_command,
            predict_command,
        }
    }

    fn run(
        &self,
        command: &[String],
        request: &impl Serialize,
        output_dir: &Path,
        ctx: &RoutineContext,
    ) -> Result<RoutineResult, RoutineError> {
        let Some((program, args)) = command.split_first() else {
            return Err(RoutineError::Failed("Routine command is not configured".into()));
        };
        ctx.hooks.check_cancelled()?;

        let request_path = output_dir.join(REQUEST_FILE);
        let body = serde_json::to_vec_pretty(request)
            .map_err(|e| RoutineError::Failed(format!("Failed to encode routine request: {e}")))?;
        std::fs::write(&request_path, body)
            .map_err(|e| RoutineError::Failed(format!("Failed to write routine request: {e}")))?;

        let spawned = {
            let _runtime = ctx.runtime.enter();
            Command::new(program)
                .args(args)
                .arg("--request")
                .arg(&request_path)
                .current_dir(output_dir)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
        };
        let mut child = spawned.map_err(|e| RoutineError::Failed(format!("Failed to start {program}: {e}")))?;
        tracing::debug!(pid = ?child.id(), program = %program, "Routine process started");

        // Fires on the hard interrupt, or when the routine thread gives up
        // on the child.
        let kill = ctx.interrupt.child_token();
        let stderr_tail = child.stderr.take().map(|stderr| ctx.runtime.spawn(tail_lines(stderr)));
        let (lines_tx, mut lines) = mpsc::channel(LINE_BUFFER);
        let captured = match child.stdout.take() {
            Some(stdout) => {
                ctx.runtime.spawn(forward_lines(stdout, lines_tx, kill.clone()));
                true
            }
            None => false,
        };
        let supervisor = ctx.runtime.spawn(supervise(child, kill.clone()));

        let streamed = if captured {
            stream_events(&mut lines, ctx)
        } else {
            Err(RoutineError::Failed("Routine stdout was not captured".into()))
        };
        if streamed.is_err() {
            kill.cancel();
        }

        let exit = ctx.runtime.block_on(async {
            supervisor.await.unwrap_or_else(|e| Err(io::Error::other(e)))
        });
        let tail = match stderr_tail {
            Some(task) => ctx
                .runtime
                .block_on(async { tokio::time::timeout(STDERR_GRACE, task).await })
                .ok()
                .and_then(Result::ok)
                .unwrap_or_default(),
            None => Vec::new(),
        };

        if ctx.interrupt.is_cancelled() {
            return Err(RoutineError::Cancelled);
        }
        let result = streamed?;
        let status = match exit {
            Ok(Some(status)) => status,
            Ok(None) => return Err(RoutineError::Failed("Routine process was stopped".into())),
            Err(e) => return Err(RoutineError::Failed(format!("Failed to wait for routine: {e}"))),
        };
        if !status.success() {
            let mut message = format!("Routine exited with {status}");
            if !tail.is_empty() {
                message.push('\n');
                message.push_str(&tail.join("\n"));
            }
            return Err(RoutineError::Failed(message));
        }
        result.ok_or_else(|| RoutineError::Failed("Routine exited without reporting a result".into()))
    }
}

impl Routine for CommandRoutine {
    fn train(&self, request: &TrainRequest, ctx: &RoutineContext) -> Result<TrainOutcome, RoutineError> {
        let result = self.run(&self.train_command, request, &request.output_dir, ctx)?;
        Ok(TrainOutcome {
            metrics: result.metrics,
            save_dir: result.save_dir,
            weights: result.weights,
        })
    }

    fn predict(&self, request: &PredictRequest, ctx: &RoutineContext) -> Result<PredictOutcome, RoutineError> {
        let result = self.run(&self.predict_command, request, &request.output_dir, ctx)?;
        Ok(PredictOutcome {
            images: result.images,
            detections: result.detections,
            metrics: result.metrics,
        })
    }
}

/// Handle protocol lines until the reader closes the channel. Returns the
/// reported result, if any.
fn stream_events(
    lines: &mut mpsc::Receiver<io::Result<String>>,
    ctx: &RoutineContext,
) -> Result<Option<RoutineResult>, RoutineError> {
    let hooks = &ctx.hooks;
    let mut result = None;

    while let Some(line) = lines.blocking_recv() {
        let line = line.map_err(|e| RoutineError::Failed(format!("Failed to read routine output: {e}")))?;
        hooks.check_cancelled()?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        match parse_event(trimmed) {
            Some(RoutineEvent::BatchEnd {
                epoch,
                total_epochs,
                total_batches,
            }) => hooks.on_batch_end(epoch, total_epochs, total_batches),
            Some(RoutineEvent::EpochEnd {
                epoch,
                total_epochs,
                losses,
            }) => hooks.on_epoch_end(epoch, total_epochs, &losses),
            Some(RoutineEvent::ValEnd { metrics }) => hooks.on_validation_end(&metrics),
            Some(RoutineEvent::Log { line }) => hooks.log(&line),
            Some(RoutineEvent::Result(reported)) => result = Some(reported),
            None => hooks.log(trimmed),
        }
    }
    Ok(result)
}

fn parse_event(line: &str) -> Option<RoutineEvent> {
    if !line.starts_with('{') {
        return None;
    }
    serde_json::from_str(line).ok()
}

/// Forward stdout lines until EOF, a read error, or `stop`.
async fn forward_lines(stdout: ChildStdout, lines: mpsc::Sender<io::Result<String>>, stop: CancellationToken) {
    let mut reader = BufReader::new(stdout).lines();
    loop {
        let next = tokio::select! {
            _ = stop.cancelled() => return,
            next = reader.next_line() => next,
        };
        let forwarded = match next {
            Ok(Some(line)) => lines.send(Ok(line)).await,
            Ok(None) => return,
            Err(e) => {
                let _ = lines.send(Err(e)).await;
                return;
            }
        };
        if forwarded.is_err() {
            return;
        }
    }
}

async fn tail_lines(stream: impl AsyncRead + Unpin) -> Vec<String> {
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let mut reader = BufReader::new(stream).lines();
    while let Ok(Some(line)) = reader.next_line().await {
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    tail.into()
}

/// Wait for the child to exit. When `kill` fires first the child is killed
/// and reaped, and `None` is returned.
async fn supervise(mut child: Child, kill: CancellationToken) -> io::Result<Option<ExitStatus>> {
    let exited = tokio::select! {
        status = child.wait() => Some(status),
        _ = kill.cancelled() => None,
    };
    match exited {
        Some(status) => status.map(Some),
        None => {
            tracing::info!(pid = ?child.id(), "Killing routine process");
            if let Err(e) = child.kill().await {
                tracing::warn!(error = %e, "Failed to kill routine process");
            }
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex as StdMutex};

    use assert_matches::assert_matches;
    use spektra_core::job::Hyperparams;
    use tokio::runtime::Handle;
    use uuid::Uuid;

    use super::*;
    use crate::routine::{ResolvedCheckpoint, TrainingHooks};

    #[derive(Default)]
    struct Recorder {
        events: StdMutex<Vec<String>>,
        cancelled: CancellationToken,
    }

    impl TrainingHooks for Recorder {
        fn check_cancelled(&self) -> Result<(), RoutineError> {
            if self.cancelled.is_cancelled() {
                Err(RoutineError::Cancelled)
            } else {
                Ok(())
            }
        }
        fn on_batch_end(&self, epoch: u32, _: u32, _: u32) {
            self.events.lock().unwrap().push(format!("batch {epoch}"));
        }
        fn on_epoch_end(&self, epoch: u32, _: u32, losses: &BTreeMap<String, f64>) {
            self.events.lock().unwrap().push(format!("epoch {epoch} {}", losses.len()));
        }
        fn on_validation_end(&self, _: &BTreeMap<String, f64>) {
            self.events.lock().unwrap().push("val".into());
        }
        fn log(&self, line: &str) {
            self.events.lock().unwrap().push(format!("log {line}"));
        }
    }

    fn request(output_dir: &Path) -> TrainRequest {
        TrainRequest {
            job_id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            model_architecture: "yolo11n.pt".into(),
            hyperparams: Hyperparams::default(),
            checkpoint: ResolvedCheckpoint::Scratch {
                architecture: "yolo11n.pt".into(),
            },
            dataset_version_id: None,
            dataset_dir: output_dir.join("dataset"),
            output_dir: output_dir.to_path_buf(),
        }
    }

    fn shell(script: &str) -> Vec<String> {
        vec!["sh".into(), "-c".into(), script.into(), "routine".into()]
    }

    fn context(hooks: Arc<Recorder>, interrupt: CancellationToken) -> RoutineContext {
        RoutineContext {
            hooks,
            interrupt,
            runtime: Handle::current(),
        }
    }

    #[test]
    fn protocol_lines_parse() {
        assert_matches!(
            parse_event(r#"{"event":"batch_end","epoch":2,"total_epochs":3,"total_batches":10}"#),
            Some(RoutineEvent::BatchEnd { epoch: 2, total_epochs: 3, total_batches: 10 })
        );
        assert_matches!(
            parse_event(r#"{"event":"result","weights":"best.pt"}"#),
            Some(RoutineEvent::Result(RoutineResult { weights: Some(_), .. }))
        );
        assert!(parse_event("Ultralytics 8.3.0").is_none());
        assert!(parse_event(r#"{"event":"unknown"}"#).is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn events_drive_hooks_and_result_is_returned() {
        let dir = tempfile::tempdir().unwrap();
        let script = r#"
echo '{"event":"batch_end","epoch":1,"total_epochs":1,"total_batches":1}'
echo 'plain output'
echo '{"event":"epoch_end","epoch":1,"total_epochs":1,"losses":{"box_loss":0.5}}'
echo '{"event":"val_end","metrics":{"mAP50":0.4}}'
echo '{"event":"result","metrics":{"fitness":0.4},"weights":"/tmp/best.pt"}'
"#;
        let routine = CommandRoutine::new(shell(script), Vec::new());
        let hooks = Arc::new(Recorder::default());
        let ctx = context(Arc::clone(&hooks), CancellationToken::new());
        let req = request(dir.path());

        let outcome = tokio::task::spawn_blocking(move || routine.train(&req, &ctx))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(outcome.weights, Some(PathBuf::from("/tmp/best.pt")));
        assert_eq!(outcome.metrics["fitness"], 0.4);
        assert_eq!(
            *hooks.events.lock().unwrap(),
            vec!["batch 1", "log plain output", "epoch 1 1", "val"]
        );
        assert!(dir.path().join(REQUEST_FILE).is_file());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn non_zero_exit_fails_with_stderr_tail() {
        let dir = tempfile::tempdir().unwrap();
        let routine = CommandRoutine::new(shell("echo 'CUDA out of memory' >&2; exit 3"), Vec::new());
        let ctx = context(Arc::new(Recorder::default()), CancellationToken::new());
        let req = request(dir.path());

        let result = tokio::task::spawn_blocking(move || routine.train(&req, &ctx)).await.unwrap();
        assert_matches!(result, Err(RoutineError::Failed(msg)) if msg.contains("CUDA out of memory"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_result_is_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let routine = CommandRoutine::new(shell("echo hello"), Vec::new());
        let ctx = context(Arc::new(Recorder::default()), CancellationToken::new());
        let req = request(dir.path());

        let result = tokio::task::spawn_blocking(move || routine.train(&req, &ctx)).await.unwrap();
        assert_matches!(result, Err(RoutineError::Failed(msg)) if msg.contains("without reporting"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn hard_interrupt_kills_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let routine = CommandRoutine::new(shell("echo started; exec sleep 30"), Vec::new());
        let interrupt = CancellationToken::new();
        let ctx = context(Arc::new(Recorder::default()), interrupt.clone());
        let req = request(dir.path());

        let run = tokio::task::spawn_blocking(move || routine.train(&req, &ctx));
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        interrupt.cancel();

        let result = tokio::time::timeout(std::time::Duration::from_secs(10), run)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Err(RoutineError::Cancelled));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn hard_interrupt_kills_a_child_that_closed_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let routine = CommandRoutine::new(shell("echo started; exec 1>&-; exec sleep 30"), Vec::new());
        let interrupt = CancellationToken::new();
        let hooks = Arc::new(Recorder::default());
        let ctx = context(Arc::clone(&hooks), interrupt.clone());
        let req = request(dir.path());

        let run = tokio::task::spawn_blocking(move || routine.train(&req, &ctx));
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        interrupt.cancel();

        let started = std::time::Instant::now();
        let result = tokio::time::timeout(std::time::Duration::from_secs(10), run)
            .await
            .expect("interrupt kills the child")
            .unwrap();
        assert_eq!(result, Err(RoutineError::Cancelled));
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
        assert_eq!(*hooks.events.lock().unwrap(), vec!["log started"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cooperative_stop_kills_the_child_at_the_next_line() {
        let dir = tempfile::tempdir().unwrap();
        let routine = CommandRoutine::new(
            shell("while true; do echo '{\"event\":\"log\",\"line\":\"tick\"}'; sleep 0.05; done"),
            Vec::new(),
        );
        let hooks = Arc::new(Recorder::default());
        let ctx = context(Arc::clone(&hooks), CancellationToken::new());
        let req = request(dir.path());

        let run = tokio::task::spawn_blocking(move || routine.train(&req, &ctx));
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        hooks.cancelled.cancel();

        let result = tokio::time::timeout(std::time::Duration::from_secs(10), run)
            .await
            .expect("stop request ends the routine")
            .unwrap();
        assert_eq!(result, Err(RoutineError::Cancelled));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unconfigured_command_fails() {
        let dir = tempfile::tempdir().unwrap();
        let routine = CommandRoutine::new(Vec::new(), Vec::new());
        let ctx = context(Arc::new(Recorder::default()), CancellationToken::new());
        let req = request(dir.path());

        let result = tokio::task::spawn_blocking(move || routine.train(&req, &ctx)).await.unwrap();
        assert_matches!(result, Err(RoutineError::Failed(_)));
    }
}
