//! Spektra API server library.
//!
//! Exposes the job submitter, routes, WebSocket streaming and background
//! loops so integration tests and the binary entrypoint share them.

pub mod background;
pub mod config;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod response;
pub mod router;
pub mod routes;
pub mod state;
pub mod ws;
