//! Smart-recording admission gate for capture-card paths.
//!
//! Capture cards occasionally emit gray or blank frames while idle; the gate
//! defers auto-recording until actual colorful content has been observed.
//! Observations are evaluated in windows of three policy ticks: a window
//! whose colorfulness sum exceeds the path's threshold admits the path, any
//! other complete window is discarded and a fresh one begins.

use dashmap::DashMap;

/// Ticks after which an observation window is unconditionally discarded.
const MAX_PING_COUNT: i64 = 12;

/// Observations per evaluation window.
const REQUIRED_PINGS: i64 = 3;

#[derive(Debug, Default, Clone, Copy)]
struct GateState {
    ping_count: i64,
    colorful_value_sum: i64,
}

/// Per-path observation state. Not persisted; a restart resets it.
#[derive(Default)]
pub struct CaptureGate {
    states: DashMap<String, GateState>,
}

impl CaptureGate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one colorfulness observation and decide admission.
    ///
    /// Admission requires a full window of [`REQUIRED_PINGS`] observations
    /// whose sum exceeds `threshold`. Both admission and a failed window
    /// reset the state, so stale observations never tip a later decision.
    pub fn observe(&self, path_name: &str, colorful_value: i64, threshold: i64) -> bool {
        let mut entry = self.states.entry(path_name.to_string()).or_default();
        entry.ping_count += 1;
        entry.colorful_value_sum += colorful_value;

        tracing::info!(
            path = path_name,
            ping_count = entry.ping_count,
            colorful_value_sum = entry.colorful_value_sum,
            current = colorful_value,
            threshold,
            "network capture check"
        );

        if entry.ping_count >= REQUIRED_PINGS {
            let admitted = entry.colorful_value_sum > threshold;
            *entry = GateState::default();
            return admitted;
        }

        // Unreachable while windows close at REQUIRED_PINGS; kept as a guard
        // against a future window size larger than the staleness bound.
        if entry.ping_count > MAX_PING_COUNT {
            *entry = GateState::default();
        }
        false
    }

    /// Forget everything about a path (device went away, path not ready).
    pub fn reset(&self, path_name: &str) {
        self.states.remove(path_name);
    }

    #[cfg(test)]
    fn ping_count(&self, path_name: &str) -> i64 {
        self.states.get(path_name).map_or(0, |s| s.ping_count)
    }
}
