//! Path inspection endpoints.

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use serde::Serialize;

use streamvault_stream::PathInfo;

use crate::error::AppResult;
use crate::AppState;

#[derive(Debug, Serialize)]
struct PathList {
    items: Vec<PathInfo>,
}

pub fn create_paths_router() -> Router<AppState> {
    Router::new()
        .route("/paths/list", get(handle_list))
        .route("/paths/get/:name", get(handle_get))
}

async fn handle_list(State(state): State<AppState>) -> Json<PathList> {
    let mut items = state.path_manager.api_paths_list().await;
    items.sort_by(|a, b| a.name.cmp(&b.name));
    Json(PathList { items })
}

async fn handle_get(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> AppResult<Json<PathInfo>> {
    let info = state.path_manager.api_paths_get(&name).await?;
    Ok(Json(info))
}
