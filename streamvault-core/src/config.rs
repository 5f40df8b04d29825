use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Name of the catch-all path configuration entry.
pub const ALL_OTHERS: &str = "all_others";

/// Sentinel source value for paths fed by an external publisher.
pub const SOURCE_PUBLISHER: &str = "publisher";

/// Device type for network-attached HDMI/SDI capture cards.
pub const DEVICE_TYPE_NETWORK_CAPTURE: &str = "network_capture";

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub path_defaults: PathConf,
    /// Per-path configurations. Order matters: regex-named entries are tried
    /// in the order they appear here.
    pub paths: Vec<PathConf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address of the HTTP control API.
    pub api_address: String,
    /// Public domain used when building file URLs; falls back to the API
    /// address when empty.
    pub api_domain: String,
    /// Root directory for recordings and snapshots.
    pub record_path: String,
    /// Base URL of the snapshot/color-analysis service, if deployed.
    pub snapshot_service_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            api_address: "0.0.0.0:9997".to_string(),
            api_domain: String::new(),
            record_path: "./recordings".to_string(),
            snapshot_service_url: None,
        }
    }
}

impl ServerConfig {
    /// Base URL used to build public file URLs (`<base>/res<relative_path>`).
    #[must_use]
    pub fn api_base_url(&self) -> String {
        if self.api_domain.is_empty() {
            format!("http://{}", self.api_address)
        } else {
            format!("https://{}", self.api_domain)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// Configuration of a single path.
///
/// A name beginning with `~` is a regular expression matched against incoming
/// path names; the reserved name `all_others` matches anything not otherwise
/// bound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathConf {
    pub name: String,
    /// `publisher` or a pull-source URI (e.g. `rtsp://…`).
    pub source: String,
    /// Preferred transport for pull sources (`udp`, `tcp`, …).
    pub transport: Option<String>,

    // Recording policy
    pub record: bool,
    pub device_type: String,
    pub record_min_threshold: i64,
    /// Duration of each policy-started recording, in seconds.
    pub auto_record_task_out_duration: u64,
    /// Days after which date directories are swept; 0 disables cleanup.
    pub record_clear_days_ago: u32,

    // Display metadata
    pub source_name: String,
    pub group_name: String,
    pub order: i64,
    pub show_list: bool,

    // Webhooks
    pub record_create_webhook: Option<String>,
    pub record_del_webhook: Option<String>,

    // Image post-processing defaults for snapshots
    pub cut: String,
    pub brightness: f64,
    pub contrast: f64,
    pub saturation: f64,

    // Snapshot parameters
    pub snapshot_interval: u64,
    pub snapshot_width: u32,
}

impl Default for PathConf {
    fn default() -> Self {
        Self {
            name: String::new(),
            source: SOURCE_PUBLISHER.to_string(),
            transport: None,
            record: false,
            device_type: String::new(),
            record_min_threshold: 0,
            auto_record_task_out_duration: 0,
            record_clear_days_ago: 0,
            source_name: String::new(),
            group_name: String::new(),
            order: 0,
            show_list: true,
            record_create_webhook: None,
            record_del_webhook: None,
            cut: String::new(),
            brightness: 0.0,
            contrast: 0.0,
            saturation: 0.0,
            snapshot_interval: 0,
            snapshot_width: 0,
        }
    }
}

impl PathConf {
    #[must_use]
    pub fn is_regex(&self) -> bool {
        self.name.starts_with('~')
    }

    #[must_use]
    pub fn is_network_capture(&self) -> bool {
        self.device_type == DEVICE_TYPE_NETWORK_CAPTURE
    }

    /// Auto-record timeout with the 30 minute fallback applied.
    #[must_use]
    pub fn auto_record_timeout(&self) -> Duration {
        if self.auto_record_task_out_duration == 0 {
            Duration::from_secs(30 * 60)
        } else {
            Duration::from_secs(self.auto_record_task_out_duration)
        }
    }

    /// Smart-recording admission threshold with the default applied.
    #[must_use]
    pub fn min_threshold(&self) -> i64 {
        if self.record_min_threshold <= 0 {
            1
        } else {
            self.record_min_threshold
        }
    }

    fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.name.is_empty() {
            errors.push("path name must not be empty".to_string());
        }
        if !self.is_regex() && self.name.contains('/') {
            errors.push(format!("path name '{}' must not contain '/'", self.name));
        }
        if self.is_regex() {
            if let Err(e) = Regex::new(&self.name[1..]) {
                errors.push(format!("path name '{}' is not a valid regex: {e}", self.name));
            }
        }
        if self.source.is_empty() {
            errors.push(format!("path '{}' has an empty source", self.name));
        }
        errors
    }
}

/// Ordered set of path configurations with the lookup rule of the server:
/// exact names win, then regex-named entries in configuration order, then
/// `all_others`.
#[derive(Debug, Clone, Default)]
pub struct PathConfSet {
    confs: Vec<Arc<PathConf>>,
    regexes: Vec<(usize, Regex)>,
}

impl PathConfSet {
    pub fn new(confs: Vec<PathConf>) -> crate::Result<Self> {
        let confs: Vec<Arc<PathConf>> = confs.into_iter().map(Arc::new).collect();
        let mut regexes = Vec::new();
        for (i, conf) in confs.iter().enumerate() {
            if conf.is_regex() {
                let re = Regex::new(&conf.name[1..]).map_err(|e| {
                    crate::Error::ConfigInvalid(format!("invalid path regex '{}': {e}", conf.name))
                })?;
                regexes.push((i, re));
            }
        }
        Ok(Self { confs, regexes })
    }

    /// All entries in configuration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<PathConf>> {
        self.confs.iter()
    }

    /// Entry with exactly this configured name (including `~`-prefixed ones).
    #[must_use]
    pub fn get_exact(&self, conf_name: &str) -> Option<&Arc<PathConf>> {
        self.confs.iter().find(|c| c.name == conf_name)
    }

    /// Resolve the configuration governing a concrete path name.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<&Arc<PathConf>> {
        if let Some(conf) = self
            .confs
            .iter()
            .find(|c| !c.is_regex() && c.name != ALL_OTHERS && c.name == name)
        {
            return Some(conf);
        }
        for (i, re) in &self.regexes {
            if re.is_match(name) {
                return Some(&self.confs[*i]);
            }
        }
        self.confs.iter().find(|c| c.name == ALL_OTHERS)
    }

    /// Names of all statically (non-regex, non-catch-all) configured paths.
    pub fn static_names(&self) -> impl Iterator<Item = &str> {
        self.confs
            .iter()
            .filter(|c| !c.is_regex() && c.name != ALL_OTHERS)
            .map(|c| c.name.as_str())
    }

    /// Smallest positive retention across all entries; `None` when cleanup is
    /// disabled everywhere.
    #[must_use]
    pub fn min_clear_days_ago(&self) -> Option<u32> {
        self.confs
            .iter()
            .map(|c| c.record_clear_days_ago)
            .filter(|&d| d > 0)
            .min()
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("STREAMVAULT")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Validate the configuration, returning every problem found.
    ///
    /// Any error here is fatal at startup.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.api_address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "server.api_address '{}' is not a valid socket address",
                self.server.api_address
            ));
        }
        if self.server.record_path.is_empty() {
            errors.push("server.record_path must not be empty".to_string());
        }

        let mut seen = std::collections::HashSet::new();
        for conf in &self.paths {
            errors.extend(conf.validate());
            if !seen.insert(conf.name.clone()) {
                errors.push(format!("duplicate path name '{}'", conf.name));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Build the ordered path-configuration set used by the managers.
    pub fn path_conf_set(&self) -> crate::Result<PathConfSet> {
        PathConfSet::new(self.paths.clone())
    }
}
