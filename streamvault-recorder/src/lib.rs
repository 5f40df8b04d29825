//! The Pro recording subsystem: per-path recording tasks with retry and
//! timeout, the at-most-one-task-per-path manager with its auto-record
//! policy loop and smart-recording admission, the capture-device health
//! supervisor, and the retention sweeper.

pub mod cleaner;
pub mod device;
pub mod gate;
pub mod health;
pub mod manager;
mod recorders;
pub mod snapshot;
pub mod task;
pub mod webhook;

pub use cleaner::Cleaner;
pub use device::DeviceClient;
pub use gate::CaptureGate;
pub use health::HealthChecker;
pub use manager::{Manager, StartParams, StartResponse, StopResponse};
pub use snapshot::{ColorChecker, HttpSnapshotClient, SnapshotGetter};
pub use task::{RecordFormat, Task};
pub use webhook::WebhookNotifier;
