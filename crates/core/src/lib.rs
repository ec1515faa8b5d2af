//! Domain types shared by the Spektra API server and the training worker.
//!
//! Everything in this crate is pure logic: no database, no network, no
//! filesystem. Both sides of the submit / execute split depend on it so
//! that channel names, task payloads and progress snapshots agree.

pub mod artifact;
pub mod catalog;
pub mod channel;
pub mod error;
pub mod job;
pub mod job_events;
pub mod progress;
pub mod telemetry;
pub mod types;
