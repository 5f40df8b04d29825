//! Per-capture-device health supervision.
//!
//! Every path whose device type is `network_capture` gets an independent
//! 60-second monitor: probe device inputs, then probe the snapshot service.
//! Six consecutive snapshot failures trigger the device reboot sequence.
//! Device-level errors are absorbed silently; only a failing reboot attempt
//! is logged at error level.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use streamvault_core::{PathConf, PathConfSet};

use crate::device::{parse_device_ip, parse_stream_name, DeviceClient};
use crate::snapshot::SnapshotGetter;

const CHECK_INTERVAL: Duration = Duration::from_secs(60);
const FAILURE_THRESHOLD: u32 = 6;

struct Monitor {
    cancel: CancellationToken,
    failure_count: Arc<AtomicU32>,
}

pub struct HealthChecker {
    snapshot: Arc<dyn SnapshotGetter>,
    device: DeviceClient,
    monitors: DashMap<String, Monitor>,
    cancel: CancellationToken,
    check_interval: Duration,
}

impl HealthChecker {
    /// Start monitors for every capture path in the configuration.
    #[must_use]
    pub fn spawn(path_confs: &PathConfSet, snapshot: Arc<dyn SnapshotGetter>) -> Arc<Self> {
        Self::spawn_with_interval(path_confs, snapshot, CHECK_INTERVAL)
    }

    fn spawn_with_interval(
        path_confs: &PathConfSet,
        snapshot: Arc<dyn SnapshotGetter>,
        check_interval: Duration,
    ) -> Arc<Self> {
        let checker = Arc::new(Self {
            snapshot,
            device: DeviceClient::new(),
            monitors: DashMap::new(),
            cancel: CancellationToken::new(),
            check_interval,
        });

        for conf in path_confs.iter() {
            if conf.is_network_capture() {
                checker.start_monitor(conf);
            }
        }

        info!(monitors = checker.monitors.len(), "health checker initialized");
        checker
    }

    /// Apply a new configuration: stop monitors for removed or re-typed
    /// paths, start monitors for new capture paths, keep the rest (their
    /// failure counters survive).
    pub fn reload_path_confs(self: &Arc<Self>, path_confs: &PathConfSet) {
        let mut stop = Vec::new();
        for entry in &self.monitors {
            let keep = path_confs
                .get_exact(entry.key())
                .is_some_and(|c| c.is_network_capture());
            if !keep {
                stop.push(entry.key().clone());
            }
        }
        for name in stop {
            if let Some((_, monitor)) = self.monitors.remove(&name) {
                info!(path = %name, "stopping health check");
                monitor.cancel.cancel();
            }
        }

        for conf in path_confs.iter() {
            if conf.is_network_capture() && !self.monitors.contains_key(&conf.name) {
                self.start_monitor(conf);
            }
        }

        info!(monitors = self.monitors.len(), "health check configurations reloaded");
    }

    pub fn close(&self) {
        self.cancel.cancel();
        for entry in &self.monitors {
            entry.value().cancel.cancel();
        }
        self.monitors.clear();
        info!("health checker closed");
    }

    fn start_monitor(self: &Arc<Self>, conf: &Arc<PathConf>) {
        let device_ip = match parse_device_ip(&conf.source) {
            Ok(ip) => ip,
            Err(e) => {
                warn!(path = %conf.name, error = %e, "failed to start health check");
                return;
            }
        };
        let stream_name = match parse_stream_name(&conf.source) {
            Ok(name) => name,
            Err(e) => {
                warn!(path = %conf.name, error = %e, "failed to start health check");
                return;
            }
        };

        let cancel = self.cancel.child_token();
        let failure_count = Arc::new(AtomicU32::new(0));
        self.monitors.insert(
            conf.name.clone(),
            Monitor {
                cancel: cancel.clone(),
                failure_count: Arc::clone(&failure_count),
            },
        );

        info!(
            path = %conf.name,
            device = %device_ip,
            stream = %stream_name,
            interval = ?self.check_interval,
            threshold = FAILURE_THRESHOLD,
            "started health check"
        );

        let checker = Arc::clone(self);
        let path_name = conf.name.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(checker.check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The interval's first tick is immediate; skip it so the first
            // probe happens one full interval after startup.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        checker
                            .perform_check(&path_name, &device_ip, &failure_count)
                            .await;
                    }
                    () = cancel.cancelled() => {
                        debug!(path = %path_name, "health check monitor stopped");
                        return;
                    }
                }
            }
        });
    }

    async fn perform_check(
        &self,
        path_name: &str,
        device_ip: &str,
        failure_count: &AtomicU32,
    ) {
        // A device with no available inputs is idle, not broken.
        match self.device.input_status(device_ip).await {
            Ok(0) | Err(_) => {
                debug!(device = %device_ip, "device not available, skipping snapshot check");
                return;
            }
            Ok(_) => {}
        }

        match self.snapshot.get_snapshot(path_name).await {
            Ok(_) => {
                if failure_count.swap(0, Ordering::SeqCst) > 0 {
                    info!(path = %path_name, "health check recovered, resetting failure count");
                }
            }
            Err(e) => {
                warn!(path = %path_name, error = %e, "health check failed");
                if note_snapshot_failure(failure_count) {
                    error!(
                        path = %path_name,
                        device = %device_ip,
                        "health check failure threshold reached, rebooting device"
                    );
                    match self.device.reboot(device_ip).await {
                        Ok(()) => info!(device = %device_ip, "device reboot request sent"),
                        Err(e) => error!(device = %device_ip, error = %e, "failed to reboot device"),
                    }
                }
            }
        }
    }

}

/// Account one snapshot failure. Returns true when the threshold is reached;
/// the counter resets in that case, whether or not the reboot that follows
/// succeeds.
fn note_snapshot_failure(failure_count: &AtomicU32) -> bool {
    let failures = failure_count.fetch_add(1, Ordering::SeqCst) + 1;
    if failures >= FAILURE_THRESHOLD {
        failure_count.store(0, Ordering::SeqCst);
        true
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use streamvault_core::Error;

    struct FailingSnapshots;

    #[async_trait]
    impl SnapshotGetter for FailingSnapshots {
        async fn get_snapshot(&self, _path_name: &str) -> streamvault_core::Result<(Vec<u8>, String)> {
            Err(Error::SnapshotFailed("no frame".into()))
        }
    }

    fn capture_conf(name: &str) -> PathConf {
        PathConf {
            name: name.to_string(),
            source: "rtsp://192.0.2.1/live0".to_string(),
            device_type: streamvault_core::config::DEVICE_TYPE_NETWORK_CAPTURE.to_string(),
            ..PathConf::default()
        }
    }

    fn plain_conf(name: &str) -> PathConf {
        PathConf {
            name: name.to_string(),
            source: "rtsp://192.0.2.9/live0".to_string(),
            ..PathConf::default()
        }
    }

    fn set(confs: Vec<PathConf>) -> PathConfSet {
        PathConfSet::new(confs).unwrap()
    }

    #[tokio::test]
    async fn test_monitors_only_capture_paths() {
        let checker = HealthChecker::spawn(
            &set(vec![capture_conf("cap1"), plain_conf("cam1")]),
            Arc::new(FailingSnapshots),
        );
        assert!(checker.monitors.contains_key("cap1"));
        assert!(!checker.monitors.contains_key("cam1"));
        checker.close();
    }

    #[tokio::test]
    async fn test_invalid_source_is_skipped() {
        let mut broken = capture_conf("cap1");
        broken.source = "not a url".to_string();
        let checker = HealthChecker::spawn(&set(vec![broken]), Arc::new(FailingSnapshots));
        assert!(checker.monitors.is_empty());
        checker.close();
    }

    #[tokio::test]
    async fn test_reload_diff_starts_and_stops_monitors() {
        let checker = HealthChecker::spawn(
            &set(vec![capture_conf("cap1"), capture_conf("cap2")]),
            Arc::new(FailingSnapshots),
        );
        assert_eq!(checker.monitors.len(), 2);

        // cap2 is re-typed to a plain path, cap3 appears.
        let mut retyped = capture_conf("cap2");
        retyped.device_type = String::new();
        checker.reload_path_confs(&set(vec![
            capture_conf("cap1"),
            retyped,
            capture_conf("cap3"),
        ]));

        assert!(checker.monitors.contains_key("cap1"));
        assert!(!checker.monitors.contains_key("cap2"));
        assert!(checker.monitors.contains_key("cap3"));
        checker.close();
    }

    #[test]
    fn test_reboot_issued_on_sixth_consecutive_failure() {
        let counter = AtomicU32::new(0);
        for _ in 0..FAILURE_THRESHOLD - 1 {
            assert!(!note_snapshot_failure(&counter));
        }
        assert!(note_snapshot_failure(&counter));
        // Counter reset whether or not the reboot succeeded.
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        // The next failure starts a fresh window.
        assert!(!note_snapshot_failure(&counter));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
