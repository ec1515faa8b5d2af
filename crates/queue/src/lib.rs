//! Task Queue: a multi-queue broker carrying task name plus payload from
//! the submitter to workers, with out-of-band revocation by task handle.
//!
//! Delivery is at-least-once. A claimed task holds a lease that its worker
//! renews; when a worker dies the lease lapses and the task is delivered
//! again. Task bodies must therefore be idempotent on replay.

pub mod broker;
pub mod memory;
pub mod postgres;
pub mod task;

pub use broker::{BrokerError, BrokerResult, RevocationStream, TaskBroker};
pub use memory::MemoryTaskBroker;
pub use postgres::PgTaskBroker;
pub use task::{ClaimedTask, QueueName, Revocation, TaskHandle, TaskMessage, TaskPayload, TaskState};
