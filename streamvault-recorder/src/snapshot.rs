//! Seams toward the snapshot / color-analysis service.
//!
//! The service itself is a separate deployment; the recording manager and
//! the health checker only consume these two capabilities.

use async_trait::async_trait;
use std::time::Duration;

use streamvault_core::{Error, Result};

const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(5);

/// Fetch the latest snapshot image of a path.
#[async_trait]
pub trait SnapshotGetter: Send + Sync {
    /// Returns the image bytes and their content type.
    async fn get_snapshot(&self, path_name: &str) -> Result<(Vec<u8>, String)>;
}

/// Judge how colorful the current video of a path is.
#[async_trait]
pub trait ColorChecker: Send + Sync {
    /// Returns a colorfulness percentage in `0..=100`.
    async fn is_colorful(&self, path_name: &str) -> Result<i64>;
}

/// HTTP client for a deployed snapshot service.
#[derive(Clone)]
pub struct HttpSnapshotClient {
    base_url: String,
    http: reqwest::Client,
}

impl HttpSnapshotClient {
    #[must_use]
    pub fn new(base_url: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl SnapshotGetter for HttpSnapshotClient {
    async fn get_snapshot(&self, path_name: &str) -> Result<(Vec<u8>, String)> {
        let url = format!("{}/snapshot/{path_name}", self.base_url);
        let response = self
            .http
            .get(&url)
            .timeout(SNAPSHOT_TIMEOUT)
            .send()
            .await
            .map_err(|e| Error::SnapshotFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::SnapshotFailed(format!(
                "snapshot service returned status {}",
                response.status()
            )));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("image/jpeg")
            .to_string();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::SnapshotFailed(e.to_string()))?;
        if bytes.is_empty() {
            return Err(Error::SnapshotFailed("empty snapshot body".to_string()));
        }
        Ok((bytes.to_vec(), content_type))
    }
}

#[async_trait]
impl ColorChecker for HttpSnapshotClient {
    async fn is_colorful(&self, path_name: &str) -> Result<i64> {
        let url = format!("{}/colorful/{path_name}", self.base_url);
        let response = self
            .http
            .get(&url)
            .timeout(SNAPSHOT_TIMEOUT)
            .send()
            .await
            .map_err(|e| Error::SnapshotFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::SnapshotFailed(format!(
                "color check returned status {}",
                response.status()
            )));
        }

        let text = response
            .text()
            .await
            .map_err(|e| Error::SnapshotFailed(e.to_string()))?;
        text.trim()
            .parse::<i64>()
            .map_err(|e| Error::SnapshotFailed(format!("bad colorful value '{text}': {e}")))
    }
}
