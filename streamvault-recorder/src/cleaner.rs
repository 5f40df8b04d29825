//! Time-based retention sweeping over date-partitioned recording folders.
//!
//! One sweep on startup, then hourly. Directory names are `YYYYMMDD`, which
//! makes the cutoff a plain string comparison.

use chrono::{Duration as ChronoDuration, Local, NaiveDate};
use regex::Regex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use streamvault_core::PathConfSet;

use crate::webhook::{RecordDeleted, WebhookNotifier};

const SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

pub struct Cleaner {
    reload_tx: mpsc::Sender<PathConfSet>,
    cancel: CancellationToken,
}

struct Sweeper {
    record_root: PathBuf,
    path_confs: PathConfSet,
    date_pattern: Regex,
    webhooks: WebhookNotifier,
}

impl Cleaner {
    /// Start the sweep loop. The first sweep runs immediately.
    #[must_use]
    pub fn spawn(record_root: PathBuf, path_confs: PathConfSet) -> Arc<Self> {
        let (reload_tx, reload_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();

        let sweeper = Sweeper {
            record_root,
            path_confs,
            date_pattern: Regex::new(r"^\d{8}$").expect("static pattern"),
            webhooks: WebhookNotifier::new(),
        };
        tokio::spawn(run(sweeper, reload_rx, cancel.clone()));

        Arc::new(Self { reload_tx, cancel })
    }

    /// Hand the loop a new configuration set; takes effect before the next
    /// sweep.
    pub async fn reload_path_confs(&self, path_confs: PathConfSet) {
        tokio::select! {
            result = self.reload_tx.send(path_confs) => {
                if result.is_err() {
                    warn!("record cleaner is gone, reload dropped");
                }
            }
            () = self.cancel.cancelled() => {}
        }
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}

async fn run(
    mut sweeper: Sweeper,
    mut reload_rx: mpsc::Receiver<PathConfSet>,
    cancel: CancellationToken,
) {
    sweeper.sweep(Local::now().date_naive());

    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // consume the immediate first tick

    loop {
        tokio::select! {
            _ = ticker.tick() => sweeper.sweep(Local::now().date_naive()),
            new_confs = reload_rx.recv() => {
                match new_confs {
                    Some(confs) => sweeper.path_confs = confs,
                    None => return,
                }
            }
            () = cancel.cancelled() => {
                info!("record cleaner stopped");
                return;
            }
        }
    }
}

impl Sweeper {
    /// Remove every date directory older than today minus the smallest
    /// positive per-path retention.
    ///
    /// The minimum is taken across all paths because recordings of every
    /// path share the date directories; a path with a longer retention can
    /// therefore lose files earlier than its own setting suggests.
    fn sweep(&self, today: NaiveDate) {
        if !self.record_root.is_dir() {
            return;
        }

        let Some(min_days_ago) = self.path_confs.min_clear_days_ago() else {
            return;
        };

        let cutoff = today - ChronoDuration::days(i64::from(min_days_ago));
        let cutoff_str = cutoff.format("%Y%m%d").to_string();
        debug!(min_days_ago, cutoff = %cutoff_str, "scanning recording folders");

        let entries = match std::fs::read_dir(&self.record_root) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "failed to read record path");
                return;
            }
        };

        let mut deleted = 0usize;
        for entry in entries.flatten() {
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if !file_type.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !self.date_pattern.is_match(name) {
                continue;
            }

            // YYYYMMDD sorts lexicographically in date order.
            if name < cutoff_str.as_str() {
                info!(folder = %name, "removing expired recording folder");
                match std::fs::remove_dir_all(entry.path()) {
                    Ok(()) => {
                        deleted += 1;
                        self.notify_deleted(name);
                    }
                    Err(e) => warn!(folder = %name, error = %e, "failed to remove folder"),
                }
            }
        }

        if deleted > 0 {
            info!(deleted, "removed expired recording folders");
        }
    }

    fn notify_deleted(&self, folder: &str) {
        let urls: std::collections::HashSet<String> = self
            .path_confs
            .iter()
            .filter(|c| c.record_clear_days_ago > 0)
            .filter_map(|c| c.record_del_webhook.clone())
            .collect();
        for url in urls {
            self.webhooks.notify(
                url,
                RecordDeleted {
                    path: format!("/{folder}"),
                },
            );
        }
    }
}
