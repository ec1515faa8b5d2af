use std::sync::Arc;

use crate::config::ServerConfig;
use crate::engine::JobSubmitter;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// Cheaply cloneable: everything inside is behind `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub submitter: Arc<JobSubmitter>,
}
