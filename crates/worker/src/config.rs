use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use spektra_queue::QueueName;
use spektra_telemetry::TelemetryTtl;

#[derive(Debug, thiserror::Error)]
#[error("{name} must be a valid {expected}, got {value:?}")]
pub struct ConfigError {
    name: &'static str,
    expected: &'static str,
    value: String,
}

/// Worker configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    /// Queues consumed, in claim order (default: `train,predict,default`).
    pub queues: Vec<QueueName>,
    /// Executions run concurrently by this process (default: `1`).
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub task_lease: Duration,
    pub shutdown_timeout: Duration,
    pub telemetry_ttl: TelemetryTtl,
    /// Batches between log lines with progress (default: `10`).
    pub progress_every_batches: u32,
    /// Batches between progress-only updates (default: `5`).
    pub progress_tick_batches: u32,
    pub artifact_root: PathBuf,
    /// Parent of per-execution scratch directories (default: system temp).
    pub scratch_root: Option<PathBuf>,
    pub train_command: Vec<String>,
    pub predict_command: Vec<String>,
}

impl WorkerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                         | Default                           |
    /// |---------------------------------|-----------------------------------|
    /// | `DATABASE_URL`                  | required                          |
    /// | `WORKER_QUEUES`                 | `train,predict,default`           |
    /// | `WORKER_CONCURRENCY`            | `1`                               |
    /// | `WORKER_POLL_INTERVAL_MS`       | `1000`                            |
    /// | `TASK_LEASE_SECS`               | `120`                             |
    /// | `SHUTDOWN_TIMEOUT_SECS`         | `30`                              |
    /// | `TELEMETRY_LOG_TTL_SECS`        | `604800`                          |
    /// | `TELEMETRY_PROGRESS_TTL_SECS`   | `86400`                           |
    /// | `PROGRESS_EVERY_BATCHES`        | `10`                              |
    /// | `PROGRESS_TICK_BATCHES`         | `5`                               |
    /// | `ARTIFACT_ROOT`                 | `./artifacts`                     |
    /// | `SCRATCH_ROOT`                  | system temp dir                   |
    /// | `TRAIN_COMMAND`                 | `python -m spektra_trainer train` |
    /// | `PREDICT_COMMAND`               | `python -m spektra_trainer predict` |
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("DATABASE_URL").map_err(|_| ConfigError {
            name: "DATABASE_URL",
            expected: "connection string",
            value: String::new(),
        })?;

        let queues = QueueName::parse_list(&env_string("WORKER_QUEUES", "train,predict,default"));

        Ok(Self {
            database_url,
            queues,
            concurrency: env_parse::<usize>("WORKER_CONCURRENCY", "1", "usize")?.max(1),
            poll_interval: Duration::from_millis(env_parse("WORKER_POLL_INTERVAL_MS", "1000", "u64")?),
            task_lease: Duration::from_secs(env_parse("TASK_LEASE_SECS", "120", "u64")?),
            shutdown_timeout: Duration::from_secs(env_parse("SHUTDOWN_TIMEOUT_SECS", "30", "u64")?),
            telemetry_ttl: TelemetryTtl {
                log: Duration::from_secs(env_parse("TELEMETRY_LOG_TTL_SECS", "604800", "u64")?),
                progress: Duration::from_secs(env_parse("TELEMETRY_PROGRESS_TTL_SECS", "86400", "u64")?),
            },
            progress_every_batches: env_parse("PROGRESS_EVERY_BATCHES", "10", "u32")?,
            progress_tick_batches: env_parse("PROGRESS_TICK_BATCHES", "5", "u32")?,
            artifact_root: PathBuf::from(env_string("ARTIFACT_ROOT", "./artifacts")),
            scratch_root: std::env::var("SCRATCH_ROOT").ok().map(PathBuf::from),
            train_command: split_command(&env_string("TRAIN_COMMAND", "python -m spektra_trainer train")),
            predict_command: split_command(&env_string(
                "PREDICT_COMMAND",
                "python -m spektra_trainer predict",
            )),
        })
    }
}

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.into())
}

fn env_parse<T: FromStr>(name: &'static str, default: &str, expected: &'static str) -> Result<T, ConfigError> {
    let value = env_string(name, default);
    value.parse().map_err(|_| ConfigError {
        name,
        expected,
        value,
    })
}

/// Split a command line on whitespace. No quoting support.
pub fn split_command(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_string).collect()
}
