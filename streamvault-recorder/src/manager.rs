//! The at-most-one-recording-per-path engine.
//!
//! Serves API start/stop requests, runs the 5-second auto-record policy
//! loop, consumes path lifecycle events to tear down policy recordings, and
//! gates capture-card paths through the smart-recording admission check.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use streamvault_core::{Error, PathConf, PathConfSet, Result};
use streamvault_stream::{PathEvent, PathManager};

use crate::device::{parse_device_ip, DeviceClient};
use crate::gate::CaptureGate;
use crate::snapshot::ColorChecker;
use crate::task::{RecordFormat, Task, TaskParams};
use crate::webhook::{RecordCreated, WebhookNotifier};

/// Policy loop tick interval.
const AUTO_RECORD_TICK: Duration = Duration::from_secs(5);

/// Default recording length when the caller does not specify one.
const DEFAULT_TASK_MINUTES: f64 = 30.0;

/// Parameters of a start-recording request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartParams {
    pub name: String,
    pub video_format: RecordFormat,
    #[serde(default)]
    pub task_out_minutes: f64,
    #[serde(default)]
    pub file_name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartResponse {
    pub existed: bool,
    pub success: bool,
    pub id: String,
    pub name: String,
    pub file_name: String,
    pub file_path: String,
    pub full_path: String,
    #[serde(rename = "fileURL")]
    pub file_url: String,
    pub task_end_time: DateTime<Local>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopResponse {
    pub success: bool,
    pub name: String,
    pub file_name: String,
    pub file_path: String,
    pub full_path: String,
    #[serde(rename = "fileURL")]
    pub file_url: String,
}

pub struct Manager {
    record_root: PathBuf,
    base_url: String,
    path_manager: Arc<PathManager>,
    path_confs: RwLock<Arc<PathConfSet>>,
    path_defaults: Arc<PathConf>,

    tasks: Mutex<HashMap<String, Arc<Task>>>,
    completions_tx: mpsc::UnboundedSender<String>,
    color_checker: RwLock<Option<Arc<dyn ColorChecker>>>,
    gate: CaptureGate,
    device: DeviceClient,
    webhooks: WebhookNotifier,
    cancel: CancellationToken,
}

impl Manager {
    /// Build the manager and start its background loops: the auto-record
    /// policy tick, the completion reaper and the path-event consumer.
    #[must_use]
    pub fn spawn(
        record_root: PathBuf,
        base_url: String,
        path_confs: PathConfSet,
        path_defaults: PathConf,
        path_manager: Arc<PathManager>,
    ) -> Arc<Self> {
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let events_rx = path_manager.subscribe_events();

        let manager = Arc::new(Self {
            record_root,
            base_url,
            path_manager,
            path_confs: RwLock::new(Arc::new(path_confs)),
            path_defaults: Arc::new(path_defaults),
            tasks: Mutex::new(HashMap::new()),
            completions_tx,
            color_checker: RwLock::new(None),
            gate: CaptureGate::new(),
            device: DeviceClient::new(),
            webhooks: WebhookNotifier::new(),
            cancel: CancellationToken::new(),
        });

        tokio::spawn(Arc::clone(&manager).auto_record_loop());
        tokio::spawn(Arc::clone(&manager).completion_loop(completions_rx));
        tokio::spawn(Arc::clone(&manager).path_event_loop(events_rx));

        info!(base_url = %manager.base_url, "recording manager initialized");
        manager
    }

    /// Install the smart-recording color checker. Until this is called,
    /// capture-card paths are admitted unconditionally.
    pub async fn initialize_smart_recording(&self, color_checker: Arc<dyn ColorChecker>) {
        *self.color_checker.write().await = Some(color_checker);
        info!("smart recording for network capture devices enabled");
    }

    /// Swap the configuration map used by the policy loop.
    pub async fn reload_path_confs(&self, path_confs: PathConfSet) {
        *self.path_confs.write().await = Arc::new(path_confs);
        info!("path configurations reloaded");
    }

    /// Start a recording for a path, or report the existing task.
    pub async fn start_recording(&self, params: StartParams) -> Result<StartResponse> {
        let mut tasks = self.tasks.lock().await;

        if let Some(existing) = tasks.get(&params.name) {
            return Ok(self.start_response(existing, true));
        }

        // Surfaces PathNotFound / PathNotReady before any file is created.
        self.path_manager
            .get_stream_for_recording(&params.name)
            .await?;

        let minutes = if params.task_out_minutes <= 0.0 {
            DEFAULT_TASK_MINUTES
        } else {
            params.task_out_minutes
        };
        let timeout = Duration::from_secs_f64(minutes * 60.0);

        let task = self
            .spawn_task(
                &params.name,
                params.video_format,
                timeout,
                params.file_name.clone(),
                false,
            )
            .await?;
        tasks.insert(params.name.clone(), Arc::clone(&task));

        Ok(self.start_response(&task, false))
    }

    /// Stop a task and remove it from the registry. Blocks until the
    /// recording file is sealed.
    pub async fn stop_recording(&self, path_name: &str) -> Result<StopResponse> {
        let mut tasks = self.tasks.lock().await;
        let task = tasks
            .get(path_name)
            .cloned()
            .ok_or_else(|| Error::TaskNotFound(path_name.to_string()))?;

        // The registry keeps the entry until the file is sealed, so a
        // concurrent start cannot double-book the path mid-stop.
        task.stop().await;
        tasks.remove(path_name);
        drop(tasks);

        Ok(StopResponse {
            success: true,
            name: path_name.to_string(),
            file_name: task.file_name.clone(),
            file_path: task.relative_path.clone(),
            full_path: task.full_path.display().to_string(),
            file_url: task.file_url.clone(),
        })
    }

    /// Expected end time of every live task.
    pub async fn get_recording_states(&self) -> HashMap<String, DateTime<Local>> {
        self.tasks
            .lock()
            .await
            .iter()
            .map(|(name, task)| (name.clone(), task.end_time))
            .collect()
    }

    /// The live task for one path, if any.
    pub async fn get_task(&self, path_name: &str) -> Option<Arc<Task>> {
        self.tasks.lock().await.get(path_name).cloned()
    }

    /// Stop every task and the background loops.
    pub async fn close(&self) {
        self.cancel.cancel();
        let tasks: Vec<Arc<Task>> = {
            let mut tasks = self.tasks.lock().await;
            tasks.drain().map(|(_, task)| task).collect()
        };
        for task in tasks {
            task.stop().await;
        }
        info!("recording manager closed");
    }

    fn start_response(&self, task: &Task, existed: bool) -> StartResponse {
        StartResponse {
            existed,
            success: true,
            id: task.id.to_string(),
            name: task.path_name.clone(),
            file_name: task.file_name.clone(),
            file_path: task.relative_path.clone(),
            full_path: task.full_path.display().to_string(),
            file_url: task.file_url.clone(),
            task_end_time: task.end_time,
        }
    }

    async fn spawn_task(
        &self,
        path_name: &str,
        format: RecordFormat,
        timeout: Duration,
        custom_file_name: Option<String>,
        is_auto_record: bool,
    ) -> Result<Arc<Task>> {
        let task = Task::spawn(
            TaskParams {
                path_name: path_name.to_string(),
                format,
                record_root: self.record_root.clone(),
                timeout,
                custom_file_name,
                is_auto_record,
                base_url: self.base_url.clone(),
            },
            Arc::clone(&self.path_manager),
            self.completions_tx.clone(),
        )?;

        if let Some(url) = self.record_create_webhook(path_name).await {
            self.webhooks.notify(
                url,
                RecordCreated {
                    id: task.id.to_string(),
                    path_name: path_name.to_string(),
                    file_path: task.relative_path.clone(),
                    full_path: task.full_path.display().to_string(),
                },
            );
        }

        Ok(task)
    }

    /// Path-specific webhook URL, falling back to the path defaults.
    async fn record_create_webhook(&self, path_name: &str) -> Option<String> {
        let confs = Arc::clone(&*self.path_confs.read().await);
        confs
            .find(path_name)
            .and_then(|c| c.record_create_webhook.clone())
            .or_else(|| self.path_defaults.record_create_webhook.clone())
    }

    async fn auto_record_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(AUTO_RECORD_TICK);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("automatic recording monitor started");
        loop {
            tokio::select! {
                _ = ticker.tick() => self.auto_record_tick().await,
                () = self.cancel.cancelled() => {
                    info!("automatic recording monitor stopped");
                    return;
                }
            }
        }
    }

    async fn auto_record_tick(&self) {
        let confs = Arc::clone(&*self.path_confs.read().await);

        for conf in confs.iter().filter(|c| c.record && !c.is_regex()) {
            let path_name = conf.name.clone();

            {
                let tasks = self.tasks.lock().await;
                if tasks.contains_key(&path_name) {
                    continue;
                }
            }

            match self.path_manager.api_paths_get(&path_name).await {
                Ok(info) if info.ready => {}
                _ => continue,
            }

            if conf.is_network_capture() && !self.should_start_capture_recording(conf).await {
                continue;
            }

            info!(path = %path_name, "starting automatic recording");
            let timeout = conf.auto_record_timeout();
            // Policy recordings always use MP4.
            match self
                .spawn_task(&path_name, RecordFormat::Mp4, timeout, None, true)
                .await
            {
                Ok(task) => {
                    let lost_race = {
                        let mut tasks = self.tasks.lock().await;
                        if tasks.contains_key(&path_name) {
                            // An API start won the slot between our check and
                            // the insert; the policy task yields.
                            true
                        } else {
                            tasks.insert(path_name.clone(), Arc::clone(&task));
                            false
                        }
                    };
                    if lost_race {
                        task.stop().await;
                    } else {
                        info!(path = %path_name, duration = ?timeout, "automatic recording started");
                    }
                }
                Err(e) => {
                    warn!(path = %path_name, error = %e, "failed to start automatic recording");
                }
            }
        }
    }

    /// Smart-recording admission for one capture-card path.
    async fn should_start_capture_recording(&self, conf: &PathConf) -> bool {
        let Some(checker) = self.color_checker.read().await.clone() else {
            // Fail open: without a checker the path records like any other.
            warn!(path = %conf.name, "color checker not available, skipping smart check");
            return true;
        };

        let device_ip = match parse_device_ip(&conf.source) {
            Ok(ip) => ip,
            Err(e) => {
                warn!(path = %conf.name, error = %e, "cannot resolve capture device");
                return false;
            }
        };

        match self.device.input_status(&device_ip).await {
            Ok(0) | Err(_) => {
                self.gate.reset(&conf.name);
                return false;
            }
            Ok(_) => {}
        }

        let colorful = match checker.is_colorful(&conf.name).await {
            Ok(value) => value,
            Err(e) => {
                warn!(path = %conf.name, error = %e, "colorful check failed");
                return false;
            }
        };

        self.gate.observe(&conf.name, colorful, conf.min_threshold())
    }

    /// Reap tasks that ended on their own (deadline or retries exhausted).
    async fn completion_loop(self: Arc<Self>, mut completions_rx: mpsc::UnboundedReceiver<String>) {
        loop {
            tokio::select! {
                completed = completions_rx.recv() => {
                    let Some(path_name) = completed else { return };
                    let mut tasks = self.tasks.lock().await;
                    if let Some(task) = tasks.get(&path_name) {
                        // A replacement task may already occupy the slot.
                        if task.is_done() {
                            info!(path = %path_name, "task completed");
                            tasks.remove(&path_name);
                        }
                    }
                }
                () = self.cancel.cancelled() => return,
            }
        }
    }

    /// Tear down policy recordings when their path loses its publisher.
    /// API-initiated tasks are left alone; they retry until their own
    /// timeout.
    async fn path_event_loop(self: Arc<Self>, mut events_rx: mpsc::Receiver<PathEvent>) {
        loop {
            tokio::select! {
                event = events_rx.recv() => {
                    match event {
                        Some(PathEvent::NotReady(name)) => self.on_path_not_ready(&name).await,
                        Some(PathEvent::Ready(_)) => {}
                        None => return,
                    }
                }
                () = self.cancel.cancelled() => return,
            }
        }
    }

    async fn on_path_not_ready(&self, path_name: &str) {
        {
            let mut tasks = self.tasks.lock().await;
            let auto_task = match tasks.get(path_name) {
                Some(task) if task.is_auto_record => Some(Arc::clone(task)),
                _ => None,
            };
            if let Some(task) = auto_task {
                info!(path = %path_name, "path no longer ready, stopping automatic recording");
                task.stop().await;
                tasks.remove(path_name);
            }
        }

        self.gate.reset(path_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex as SyncMutex;
    use streamvault_stream::{
        AccessRequest, MediaDescription, Protocol, PublisherHandle, TrackFormat,
    };

    fn conf(name: &str, record: bool) -> PathConf {
        PathConf {
            name: name.to_string(),
            record,
            auto_record_task_out_duration: 60,
            ..PathConf::default()
        }
    }

    fn conf_set(confs: Vec<PathConf>) -> PathConfSet {
        PathConfSet::new(confs).unwrap()
    }

    fn desc() -> MediaDescription {
        MediaDescription::new(vec![TrackFormat::H264 {
            sps: Bytes::from_static(&[0x67, 0x64, 0x00, 0x1F]),
            pps: Bytes::from_static(&[0x68, 0xEE, 0x3C, 0x80]),
        }])
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        path_manager: Arc<PathManager>,
        manager: Arc<Manager>,
    }

    fn fixture(confs: Vec<PathConf>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let set = conf_set(confs);
        let path_manager = Arc::new(PathManager::new(set.clone(), None));
        let manager = Manager::spawn(
            dir.path().to_path_buf(),
            "http://localhost:9997".to_string(),
            set,
            PathConf::default(),
            Arc::clone(&path_manager),
        );
        Fixture {
            _dir: dir,
            path_manager,
            manager,
        }
    }

    async fn publish(fixture: &Fixture, name: &str) -> PublisherHandle {
        let publisher = fixture
            .path_manager
            .add_publisher(AccessRequest::publisher(name, Protocol::Rtsp))
            .await
            .unwrap();
        publisher.set_ready(desc(), false, false).unwrap();
        publisher
    }

    fn start_params(name: &str) -> StartParams {
        StartParams {
            name: name.to_string(),
            video_format: RecordFormat::Mp4,
            task_out_minutes: 1.0,
            file_name: None,
        }
    }

    #[tokio::test]
    async fn test_start_requires_a_publisher() {
        let fixture = fixture(vec![conf("cam3", false)]);

        let err = fixture
            .manager
            .start_recording(start_params("cam3"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PathNotReady(_)));

        let err = fixture
            .manager
            .start_recording(start_params("ghost"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PathNotFound(_)));
    }

    #[tokio::test]
    async fn test_second_start_reports_existing_task() {
        let fixture = fixture(vec![conf("cam1", false)]);
        let _publisher = publish(&fixture, "cam1").await;

        let first = fixture
            .manager
            .start_recording(start_params("cam1"))
            .await
            .unwrap();
        assert!(!first.existed);

        let second = fixture
            .manager
            .start_recording(start_params("cam1"))
            .await
            .unwrap();
        assert!(second.existed);
        assert_eq!(second.id, first.id);
        assert_eq!(second.file_name, first.file_name);

        fixture.manager.stop_recording("cam1").await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_unknown_task_twice() {
        let fixture = fixture(vec![conf("cam1", false)]);
        for _ in 0..2 {
            let err = fixture.manager.stop_recording("cam1").await.unwrap_err();
            assert!(matches!(err, Error::TaskNotFound(_)));
        }
    }

    #[tokio::test]
    async fn test_zero_minutes_falls_back_to_thirty() {
        let fixture = fixture(vec![conf("cam1", false)]);
        let _publisher = publish(&fixture, "cam1").await;

        let mut params = start_params("cam1");
        params.task_out_minutes = 0.0;
        let response = fixture.manager.start_recording(params).await.unwrap();

        let expected = Local::now() + chrono::Duration::minutes(30);
        let delta = (response.task_end_time - expected).num_seconds().abs();
        assert!(delta <= 2, "end time {delta}s away from now+30min");

        fixture.manager.stop_recording("cam1").await.unwrap();
    }

    #[tokio::test]
    async fn test_recording_states_track_live_tasks() {
        let fixture = fixture(vec![conf("cam1", false)]);
        let _publisher = publish(&fixture, "cam1").await;

        assert!(fixture.manager.get_recording_states().await.is_empty());
        fixture
            .manager
            .start_recording(start_params("cam1"))
            .await
            .unwrap();
        let states = fixture.manager.get_recording_states().await;
        assert!(states.contains_key("cam1"));

        fixture.manager.stop_recording("cam1").await.unwrap();
        assert!(fixture.manager.get_recording_states().await.is_empty());
    }

    #[tokio::test]
    async fn test_auto_record_starts_and_stops_with_readiness() {
        let fixture = fixture(vec![conf("cam1", true)]);
        let publisher = publish(&fixture, "cam1").await;

        // Within two policy ticks the task must exist.
        let mut started = false;
        for _ in 0..40 {
            tokio::time::sleep(Duration::from_millis(250)).await;
            if let Some(task) = fixture.manager.get_task("cam1").await {
                assert!(task.is_auto_record);
                started = true;
                break;
            }
        }
        assert!(started, "auto-record task did not start");

        // Publisher disconnect tears the policy task down.
        publisher.close();
        let mut stopped = false;
        for _ in 0..40 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if fixture.manager.get_task("cam1").await.is_none() {
                stopped = true;
                break;
            }
        }
        assert!(stopped, "auto-record task was not removed on not-ready");
    }

    #[tokio::test]
    async fn test_api_task_survives_not_ready() {
        let fixture = fixture(vec![conf("cam1", false)]);
        let publisher = publish(&fixture, "cam1").await;

        fixture
            .manager
            .start_recording(start_params("cam1"))
            .await
            .unwrap();
        publisher.set_not_ready();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // API-initiated tasks keep retrying until their own timeout.
        assert!(fixture.manager.get_task("cam1").await.is_some());
        fixture.manager.stop_recording("cam1").await.unwrap();
    }

    /// Scripted color checker for gate-path tests.
    struct ScriptedChecker {
        values: SyncMutex<Vec<i64>>,
    }

    #[async_trait]
    impl ColorChecker for ScriptedChecker {
        async fn is_colorful(&self, _path_name: &str) -> Result<i64> {
            let mut values = self.values.lock();
            if values.is_empty() {
                Ok(0)
            } else {
                Ok(values.remove(0))
            }
        }
    }

    #[tokio::test]
    async fn test_smart_recording_fails_open_without_checker() {
        // With no checker installed, a capture path records like any other;
        // covered through should_start_capture_recording directly.
        let mut capture = conf("cam2", true);
        capture.device_type = streamvault_core::config::DEVICE_TYPE_NETWORK_CAPTURE.to_string();
        capture.source = "rtsp://192.0.2.1/live0".to_string();
        let fixture = fixture(vec![capture.clone()]);

        assert!(
            fixture
                .manager
                .should_start_capture_recording(&capture)
                .await
        );
    }

    #[tokio::test]
    async fn test_smart_recording_skips_unreachable_device() {
        // 192.0.2.0/24 is TEST-NET; the probe fails fast and the gate must
        // hold the recording back.
        let mut capture = conf("cam2", true);
        capture.device_type = streamvault_core::config::DEVICE_TYPE_NETWORK_CAPTURE.to_string();
        capture.source = "rtsp://192.0.2.1/live0".to_string();
        let fixture = fixture(vec![capture.clone()]);

        fixture
            .manager
            .initialize_smart_recording(Arc::new(ScriptedChecker {
                values: SyncMutex::new(vec![100, 100, 100]),
            }))
            .await;

        assert!(
            !fixture
                .manager
                .should_start_capture_recording(&capture)
                .await
        );
    }
}
