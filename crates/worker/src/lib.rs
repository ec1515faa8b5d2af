//! Job Executor: consumes execution tasks, drives the long-running
//! training or inference routine, translates its hooks into telemetry,
//! reacts to cancellation and finalizes the job record.

pub mod artifact;
pub mod config;
pub mod executor;
pub mod hooks;
pub mod inputs;
pub mod metrics;
pub mod process;
pub mod routine;
pub mod worker;

pub use executor::{ExecutionControl, ExecutionError, ExecutionOutcome, Executor, ExecutorSettings};
pub use worker::{Worker, WorkerSettings};
