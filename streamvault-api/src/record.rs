//! Recording control endpoints.
//!
//! - `POST /record/start`: start (or report the existing) recording task
//! - `POST /record/stop`: stop a task and return the final file paths
//! - `GET /record/task/:name`: the live task of one path
//! - `GET /record/tasks`: all live tasks

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Local};
use serde::Serialize;
use tracing::info;

use streamvault_recorder::{StartParams, StartResponse, StopResponse};

use crate::error::{AppError, AppResult};
use crate::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TaskInfo {
    path_name: String,
    task_end_time: DateTime<Local>,
    is_recording: bool,
}

#[derive(Debug, serde::Deserialize)]
struct StopBody {
    name: String,
}

pub fn create_record_router() -> Router<AppState> {
    Router::new()
        .route("/record/start", post(handle_start))
        .route("/record/stop", post(handle_stop))
        .route("/record/task/:name", get(handle_task))
        .route("/record/tasks", get(handle_tasks))
}

async fn handle_start(
    State(state): State<AppState>,
    Json(params): Json<StartParams>,
) -> AppResult<Json<StartResponse>> {
    if params.name.is_empty() {
        return Err(AppError::bad_request("name is required"));
    }

    info!(path = %params.name, format = %params.video_format, "record start requested");
    let response = state.record_manager.start_recording(params).await?;
    Ok(Json(response))
}

async fn handle_stop(
    State(state): State<AppState>,
    Json(body): Json<StopBody>,
) -> AppResult<Json<StopResponse>> {
    if body.name.is_empty() {
        return Err(AppError::bad_request("name is required"));
    }

    info!(path = %body.name, "record stop requested");
    let response = state.record_manager.stop_recording(&body.name).await?;
    Ok(Json(response))
}

async fn handle_task(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> AppResult<Json<TaskInfo>> {
    let states = state.record_manager.get_recording_states().await;
    match states.get(&name) {
        Some(end_time) => Ok(Json(TaskInfo {
            path_name: name,
            task_end_time: *end_time,
            is_recording: true,
        })),
        None => Err(AppError::not_found("task id that does not exist")),
    }
}

async fn handle_tasks(State(state): State<AppState>) -> Json<Vec<TaskInfo>> {
    let states = state.record_manager.get_recording_states().await;
    let mut tasks: Vec<TaskInfo> = states
        .into_iter()
        .map(|(path_name, task_end_time)| TaskInfo {
            path_name,
            task_end_time,
            is_recording: true,
        })
        .collect();
    tasks.sort_by(|a, b| a.path_name.cmp(&b.path_name));
    Json(tasks)
}
