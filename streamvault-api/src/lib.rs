//! HTTP control API.
//!
//! Exposes recording control (`/record/*`) and path inspection
//! (`/paths/*`). Protocol-facing streaming endpoints live with the protocol
//! servers, not here.

pub mod error;
pub mod paths;
pub mod record;

use axum::Router;
use std::sync::Arc;

use streamvault_recorder::Manager as RecordManager;
use streamvault_stream::PathManager;

pub use error::{AppError, AppResult};

/// Shared state of all API handlers.
#[derive(Clone)]
pub struct AppState {
    pub path_manager: Arc<PathManager>,
    pub record_manager: Arc<RecordManager>,
}

/// Build the full API router.
#[must_use]
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(record::create_record_router())
        .merge(paths::create_paths_router())
        .with_state(state)
}
