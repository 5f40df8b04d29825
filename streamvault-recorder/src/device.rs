//! HTTP probes against network capture devices (HDMI/SDI encoders).

use chrono::Utc;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use streamvault_core::{Error, Result};

const INPUT_STATUS_TIMEOUT: Duration = Duration::from_millis(1500);
const REBOOT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct InputStateResponse {
    #[serde(default)]
    result: Vec<InputState>,
}

#[derive(Debug, Deserialize)]
struct InputState {
    #[serde(default)]
    avalible: bool, // the device firmware spells it this way
    #[serde(default)]
    name: String,
}

/// Client for the capture-device management endpoints.
#[derive(Clone)]
pub struct DeviceClient {
    http: reqwest::Client,
}

impl DeviceClient {
    #[must_use]
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    /// Count the available HDMI/SDI inputs of a device.
    ///
    /// A response body that fails to parse yields `Ok(0)` rather than an
    /// error: misbehaving firmware answers with HTML on occasion and an
    /// error here would flood the logs once per monitor tick.
    pub async fn input_status(&self, device_ip: &str) -> Result<usize> {
        let body = format!(
            r#"{{"id":{},"jsonrpc":"2.0","method":"enc.getInputState"}}"#,
            Utc::now().timestamp_millis()
        );
        let url = format!("http://{device_ip}/RPC");

        let response = self
            .http
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .timeout(INPUT_STATUS_TIMEOUT)
            .send()
            .await
            .map_err(|e| Error::DeviceUnavailable(format!("{device_ip}: {e}")))?;

        if response.status() != reqwest::StatusCode::OK {
            return Err(Error::DeviceUnavailable(format!(
                "{device_ip}: http status {}",
                response.status()
            )));
        }

        let text = response
            .text()
            .await
            .map_err(|e| Error::DeviceUnavailable(format!("{device_ip}: {e}")))?;

        let Ok(parsed) = serde_json::from_str::<InputStateResponse>(&text) else {
            debug!(device = %device_ip, "unparseable input-state response, treating as 0 inputs");
            return Ok(0);
        };

        Ok(parsed
            .result
            .iter()
            .filter(|r| r.avalible && (r.name == "HDMI" || r.name == "SDI"))
            .count())
    }

    /// Issue the two-step reboot sequence: form login, then the reboot call
    /// carrying the captured session cookies.
    pub async fn reboot(&self, device_ip: &str) -> Result<()> {
        let base = format!("http://{device_ip}");

        let login = self
            .http
            .post(format!("{base}/login2.php"))
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&[("name", "admin"), ("passwd", "admin")])
            .timeout(REBOOT_TIMEOUT)
            .send()
            .await
            .map_err(|e| Error::DeviceUnavailable(format!("{device_ip}: login failed: {e}")))?;

        if login.status() != reqwest::StatusCode::OK {
            return Err(Error::DeviceUnavailable(format!(
                "{device_ip}: login returned status {}",
                login.status()
            )));
        }

        let cookie_header = login
            .headers()
            .get_all(reqwest::header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(|v| v.split(';').next())
            .collect::<Vec<_>>()
            .join("; ");

        let mut reboot = self
            .http
            .post(format!("{base}/func.php?func=reboot"))
            .header(reqwest::header::ACCEPT, "application/json")
            .header(
                reqwest::header::CONTENT_TYPE,
                "application/x-www-form-urlencoded",
            )
            .timeout(REBOOT_TIMEOUT);
        if !cookie_header.is_empty() {
            reboot = reboot.header(reqwest::header::COOKIE, cookie_header);
        }

        let response = reboot
            .send()
            .await
            .map_err(|e| Error::DeviceUnavailable(format!("{device_ip}: reboot failed: {e}")))?;

        if response.status() != reqwest::StatusCode::OK {
            return Err(Error::DeviceUnavailable(format!(
                "{device_ip}: reboot returned status {}",
                response.status()
            )));
        }

        Ok(())
    }
}

impl Default for DeviceClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Extract the device host from a path's source URI.
pub fn parse_device_ip(source: &str) -> Result<String> {
    let parsed = url::Url::parse(source)
        .map_err(|e| Error::DeviceUnavailable(format!("invalid source URL '{source}': {e}")))?;
    match parsed.host_str() {
        Some(host) => Ok(host.to_string()),
        None => Err(Error::DeviceUnavailable(format!(
            "source URL '{source}' has no host"
        ))),
    }
}

/// Extract the stream name (last URL path segment) from a source URI.
pub fn parse_stream_name(source: &str) -> Result<String> {
    let parsed = url::Url::parse(source)
        .map_err(|e| Error::DeviceUnavailable(format!("invalid source URL '{source}': {e}")))?;
    parsed
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .ok_or_else(|| Error::DeviceUnavailable(format!("source URL '{source}' has no stream name")))
}
