//! A single recording session for one path.
//!
//! The task is one async state function: it attempts to attach a recorder to
//! the path's stream, funnels every failure into a retry loop (5 s backoff,
//! up to 100 attempts), and ends either at its absolute deadline or on an
//! external stop. Cancellation is a first-class select branch at every
//! state, never an afterthought.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use streamvault_core::{Error, Result};
use streamvault_stream::PathManager;

use crate::recorders::ActiveRecorder;

const MAX_RETRIES: u32 = 100;
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// On-disk container format of a recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordFormat {
    Mp4,
    Ts,
}

impl RecordFormat {
    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Mp4 => "mp4",
            Self::Ts => "ts",
        }
    }
}

impl fmt::Display for RecordFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Everything a task needs at creation time.
pub struct TaskParams {
    pub path_name: String,
    pub format: RecordFormat,
    pub record_root: PathBuf,
    pub timeout: Duration,
    pub custom_file_name: Option<String>,
    pub is_auto_record: bool,
    /// Base for building the public file URL.
    pub base_url: String,
}

/// A live recording task. Dropping the handle does not stop the recording;
/// call [`stop`](Self::stop).
pub struct Task {
    pub id: Uuid,
    pub path_name: String,
    pub format: RecordFormat,
    pub file_name: String,
    pub full_path: PathBuf,
    pub relative_path: String,
    pub file_url: String,
    pub start_time: DateTime<Local>,
    pub end_time: DateTime<Local>,
    pub is_auto_record: bool,

    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

impl Task {
    /// Create the output file location and start the recording loop.
    ///
    /// `completions` is notified with the path name when the task ends on
    /// its own (deadline or retries exhausted), not on an external stop.
    pub fn spawn(
        params: TaskParams,
        path_manager: Arc<PathManager>,
        completions: mpsc::UnboundedSender<String>,
    ) -> Result<Arc<Self>> {
        let now = Local::now();
        let file_name = generate_file_name(&params, now);
        let date_dir = now.format("%Y%m%d").to_string();
        let relative_path = format!("/{date_dir}/{file_name}");
        let full_path = params.record_root.join(&date_dir).join(&file_name);
        let file_url = format!("{}/res{relative_path}", params.base_url);

        if let Some(dir) = full_path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        let cancel = CancellationToken::new();
        let (done_tx, done) = watch::channel(false);

        let task = Arc::new(Self {
            id: Uuid::new_v4(),
            path_name: params.path_name.clone(),
            format: params.format,
            file_name,
            full_path: full_path.clone(),
            relative_path,
            file_url,
            start_time: now,
            end_time: now + chrono::Duration::from_std(params.timeout).unwrap_or_default(),
            is_auto_record: params.is_auto_record,
            cancel: cancel.clone(),
            done,
        });

        info!(
            path = %params.path_name,
            file = %task.file_name,
            format = %params.format,
            timeout = ?params.timeout,
            auto = params.is_auto_record,
            "recording task created"
        );

        tokio::spawn(run(RunContext {
            path_name: params.path_name,
            format: params.format,
            full_path,
            timeout: params.timeout,
            cancel,
            path_manager,
            completions,
            done_tx,
        }));

        Ok(task)
    }

    /// Request the task to stop and wait until the recording loop has fully
    /// terminated and the file is sealed.
    pub async fn stop(&self) {
        info!(path = %self.path_name, "stopping recording (external stop request)");
        self.cancel.cancel();
        let mut done = self.done.clone();
        while !*done.borrow() {
            if done.changed().await.is_err() {
                break;
            }
        }
    }

    /// Whether the recording loop has terminated.
    #[must_use]
    pub fn is_done(&self) -> bool {
        *self.done.borrow()
    }
}

fn generate_file_name(params: &TaskParams, now: DateTime<Local>) -> String {
    let ext = params.format.extension();
    match &params.custom_file_name {
        Some(name) => {
            if std::path::Path::new(name).extension().is_some() {
                name.clone()
            } else {
                format!("{name}.{ext}")
            }
        }
        None => {
            let id = Uuid::new_v4().simple().to_string();
            format!("{}-{}.{}", now.format("%Y%m%d-%H%M"), &id[..8], ext)
        }
    }
}

struct RunContext {
    path_name: String,
    format: RecordFormat,
    full_path: PathBuf,
    timeout: Duration,
    cancel: CancellationToken,
    path_manager: Arc<PathManager>,
    completions: mpsc::UnboundedSender<String>,
    done_tx: watch::Sender<bool>,
}

async fn run(ctx: RunContext) {
    let natural_end = run_inner(&ctx).await;

    // Mark done before announcing completion so the manager observes a
    // finished task when it reaps the registry entry.
    let _ = ctx.done_tx.send(true);
    if natural_end {
        let _ = ctx.completions.send(ctx.path_name.clone());
    }
}

/// The recording loop proper. Returns true when the task ended on its own
/// (deadline reached or retries exhausted) rather than by external stop.
async fn run_inner(ctx: &RunContext) -> bool {
    let deadline = tokio::time::Instant::now() + ctx.timeout;
    let mut retry_count: u32 = 0;

    loop {
        if tokio::time::Instant::now() >= deadline {
            info!(path = %ctx.path_name, "recording timeout");
            return true;
        }
        if ctx.cancel.is_cancelled() {
            info!(path = %ctx.path_name, "recording terminated (stop requested)");
            return false;
        }

        let (err_tx, mut err_rx) = mpsc::channel::<Error>(10);
        let recorder = match start_recorder(ctx, err_tx).await {
            Ok(recorder) => recorder,
            Err(e) => {
                warn!(path = %ctx.path_name, error = %e, "failed to start recorder");
                if ctx.cancel.is_cancelled() {
                    return false;
                }
                if retry_count >= MAX_RETRIES {
                    error!(path = %ctx.path_name, "max retries reached, giving up");
                    return true;
                }
                retry_count += 1;
                info!(
                    path = %ctx.path_name,
                    attempt = retry_count,
                    max = MAX_RETRIES,
                    "will retry recording in {RETRY_INTERVAL:?}"
                );
                tokio::select! {
                    () = tokio::time::sleep(RETRY_INTERVAL) => continue,
                    () = ctx.cancel.cancelled() => return false,
                }
            }
        };

        tokio::select! {
            () = tokio::time::sleep_until(deadline) => {
                info!(path = %ctx.path_name, "recording completed (timeout)");
                recorder.close();
                return true;
            }
            err = err_rx.recv() => {
                recorder.close();
                if let Some(err) = err {
                    error!(path = %ctx.path_name, error = %err, "recorder error");
                }
                if ctx.cancel.is_cancelled() {
                    return false;
                }
                if retry_count >= MAX_RETRIES {
                    error!(path = %ctx.path_name, "max retries reached after error, giving up");
                    return true;
                }
                retry_count += 1;
                tokio::select! {
                    () = tokio::time::sleep(RETRY_INTERVAL) => {}
                    () = ctx.cancel.cancelled() => return false,
                }
            }
            () = ctx.cancel.cancelled() => {
                info!(path = %ctx.path_name, "recording terminated");
                recorder.close();
                return false;
            }
        }
    }
}

async fn start_recorder(ctx: &RunContext, err_tx: mpsc::Sender<Error>) -> Result<ActiveRecorder> {
    let stream = ctx
        .path_manager
        .get_stream_for_recording(&ctx.path_name)
        .await?;
    ActiveRecorder::start(ctx.format, stream, &ctx.full_path, ctx.timeout, err_tx)
}
