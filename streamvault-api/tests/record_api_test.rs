// Integration tests for the recording control API
//
// Drives the axum router directly with tower's oneshot, backed by a real
// path manager and recording manager writing into a temp directory.

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use bytes::Bytes;
use http_body_util::BodyExt;
use std::sync::Arc;
use tower::ServiceExt;

use streamvault_api::{create_router, AppState};
use streamvault_core::{PathConf, PathConfSet};
use streamvault_recorder::Manager as RecordManager;
use streamvault_stream::{
    AccessRequest, MediaDescription, PathManager, Protocol, PublisherHandle, TrackFormat,
};

struct Fixture {
    _dir: tempfile::TempDir,
    path_manager: Arc<PathManager>,
    router: axum::Router,
}

fn fixture(path_names: &[&str]) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let confs = PathConfSet::new(
        path_names
            .iter()
            .map(|n| PathConf {
                name: (*n).to_string(),
                ..PathConf::default()
            })
            .collect(),
    )
    .unwrap();

    let path_manager = Arc::new(PathManager::new(confs.clone(), None));
    let record_manager = RecordManager::spawn(
        dir.path().to_path_buf(),
        "http://localhost:9997".to_string(),
        confs,
        PathConf::default(),
        Arc::clone(&path_manager),
    );

    let router = create_router(AppState {
        path_manager: Arc::clone(&path_manager),
        record_manager,
    });

    Fixture {
        _dir: dir,
        path_manager,
        router,
    }
}

async fn publish(fixture: &Fixture, name: &str) -> PublisherHandle {
    let publisher = fixture
        .path_manager
        .add_publisher(AccessRequest::publisher(name, Protocol::Rtsp))
        .await
        .unwrap();
    publisher
        .set_ready(
            MediaDescription::new(vec![TrackFormat::H264 {
                sps: Bytes::from_static(&[0x67, 0x64, 0x00, 0x1F]),
                pps: Bytes::from_static(&[0x68, 0xEE, 0x3C, 0x80]),
            }]),
            false,
            false,
        )
        .unwrap();
    publisher
}

async fn request(
    router: &axum::Router,
    method: &str,
    uri: &str,
    body: Option<serde_json::Value>,
) -> (StatusCode, serde_json::Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };
    let response = router
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

#[tokio::test]
async fn test_start_without_publisher_returns_409() {
    let fixture = fixture(&["cam3"]);
    let (status, body) = request(
        &fixture.router,
        "POST",
        "/record/start",
        Some(serde_json::json!({
            "name": "cam3",
            "videoFormat": "mp4",
            "taskOutMinutes": 1.0,
        })),
    )
    .await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"]
        .as_str()
        .unwrap()
        .contains("no one is publishing"));
}

#[tokio::test]
async fn test_start_unknown_path_returns_404() {
    let fixture = fixture(&["cam1"]);
    let (status, _) = request(
        &fixture.router,
        "POST",
        "/record/start",
        Some(serde_json::json!({ "name": "ghost", "videoFormat": "mp4" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_start_then_stop_round_trip() {
    let fixture = fixture(&["cam3"]);
    let _publisher = publish(&fixture, "cam3").await;

    let (status, body) = request(
        &fixture.router,
        "POST",
        "/record/start",
        Some(serde_json::json!({
            "name": "cam3",
            "videoFormat": "mp4",
            "taskOutMinutes": 1.0,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["existed"], false);
    assert_eq!(body["success"], true);
    assert_eq!(body["name"], "cam3");
    assert!(body["fileName"].as_str().unwrap().ends_with(".mp4"));
    assert!(body["filePath"].as_str().unwrap().starts_with('/'));
    assert!(body["fileURL"]
        .as_str()
        .unwrap()
        .starts_with("http://localhost:9997/res/"));
    assert!(body["taskEndTime"].as_str().is_some());

    // The task shows up in both task views.
    let (status, task) = request(&fixture.router, "GET", "/record/task/cam3", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(task["pathName"], "cam3");
    assert_eq!(task["isRecording"], true);

    let (status, tasks) = request(&fixture.router, "GET", "/record/tasks", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(tasks.as_array().unwrap().len(), 1);

    // Stop returns the file paths and clears the registry.
    let (status, stopped) = request(
        &fixture.router,
        "POST",
        "/record/stop",
        Some(serde_json::json!({ "name": "cam3" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stopped["success"], true);
    assert_eq!(stopped["fileName"], body["fileName"]);

    let (status, _) = request(&fixture.router, "GET", "/record/task/cam3", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_stop_without_task_returns_404_with_message() {
    let fixture = fixture(&["cam1"]);
    let (status, body) = request(
        &fixture.router,
        "POST",
        "/record/stop",
        Some(serde_json::json!({ "name": "cam1" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "task id that does not exist");
}

#[tokio::test]
async fn test_start_twice_reports_existing() {
    let fixture = fixture(&["cam1"]);
    let _publisher = publish(&fixture, "cam1").await;

    let start = serde_json::json!({ "name": "cam1", "videoFormat": "ts", "taskOutMinutes": 1.0 });
    let (_, first) = request(&fixture.router, "POST", "/record/start", Some(start.clone())).await;
    let (status, second) = request(&fixture.router, "POST", "/record/start", Some(start)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["existed"], true);
    assert_eq!(second["id"], first["id"]);
}

#[tokio::test]
async fn test_validation_errors_return_400() {
    let fixture = fixture(&["cam1"]);
    let (status, _) = request(
        &fixture.router,
        "POST",
        "/record/start",
        Some(serde_json::json!({ "name": "", "videoFormat": "mp4" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_paths_list_and_get() {
    let fixture = fixture(&["cam1", "cam2"]);
    let _publisher = publish(&fixture, "cam1").await;

    let (status, body) = request(&fixture.router, "GET", "/paths/list", None).await;
    assert_eq!(status, StatusCode::OK);
    let items = body["items"].as_array().unwrap();
    assert_eq!(items.len(), 2);

    let (status, cam1) = request(&fixture.router, "GET", "/paths/get/cam1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cam1["ready"], true);
    assert_eq!(cam1["confName"], "cam1");

    let (status, _) = request(&fixture.router, "GET", "/paths/get/ghost", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
