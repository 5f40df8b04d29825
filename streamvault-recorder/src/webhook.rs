//! Fire-and-forget webhook notifications.

use serde::Serialize;
use std::time::Duration;
use tracing::warn;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(5);

/// Payload of the record-created webhook.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordCreated {
    pub id: String,
    pub path_name: String,
    pub file_path: String,
    pub full_path: String,
}

/// Payload of the record-deleted webhook, sent by the cleaner.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordDeleted {
    pub path: String,
}

#[derive(Clone)]
pub struct WebhookNotifier {
    http: reqwest::Client,
}

impl WebhookNotifier {
    #[must_use]
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    /// POST a JSON payload on a spawned task. The caller is never blocked
    /// and failures are only logged.
    pub fn notify<T: Serialize + Send + 'static>(&self, url: String, payload: T) {
        let http = self.http.clone();
        tokio::spawn(async move {
            let result = http
                .post(&url)
                .json(&payload)
                .timeout(WEBHOOK_TIMEOUT)
                .send()
                .await;
            match result {
                Ok(response) if !response.status().is_success() => {
                    warn!(url = %url, status = %response.status(), "webhook rejected");
                }
                Ok(_) => {}
                Err(e) => warn!(url = %url, error = %e, "webhook delivery failed"),
            }
        });
    }
}

impl Default for WebhookNotifier {
    fn default() -> Self {
        Self::new()
    }
}
