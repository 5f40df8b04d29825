//! The authoritative registry mapping path names to live paths.
//!
//! Name resolution follows the configuration rule: exact names win, regex
//! names (prefix `~`) are tried in configuration order, `all_others` catches
//! the rest. Statically named paths exist from startup; pattern-matched ones
//! are instantiated on first publisher access.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use streamvault_core::{Error, PathConf, PathConfSet, Result};

use crate::auth::{AccessRequest, AllowAll, Authenticator};
use crate::events::{PathEvent, PathEventHub};
use crate::path::{Path, PublisherHandle};
use crate::stream::Stream;

/// Pause before answering a denied access request, to slow down brute force.
const AUTH_DENIED_PAUSE: Duration = Duration::from_secs(2);

/// Public view of one live path.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PathInfo {
    pub name: String,
    /// Name of the configuration entry governing this path (may be a regex
    /// name or `all_others`).
    pub conf_name: String,
    pub ready: bool,
    pub bytes_received: u64,
}

struct PathSlot {
    path: Arc<Path>,
    conf_name: String,
}

struct Registry {
    confs: PathConfSet,
    paths: HashMap<String, PathSlot>,
}

pub struct PathManager {
    auth: Arc<dyn Authenticator>,
    events: Arc<PathEventHub>,
    registry: RwLock<Registry>,
}

impl PathManager {
    #[must_use]
    pub fn new(confs: PathConfSet, auth: Option<Arc<dyn Authenticator>>) -> Self {
        let events = Arc::new(PathEventHub::new());
        let mut paths = HashMap::new();
        for name in confs.static_names() {
            let conf = Arc::clone(confs.get_exact(name).expect("static name exists"));
            paths.insert(
                name.to_string(),
                PathSlot {
                    path: Path::new(name.to_string(), conf, Arc::clone(&events)),
                    conf_name: name.to_string(),
                },
            );
        }
        Self {
            auth: auth.unwrap_or_else(|| Arc::new(AllowAll)),
            events,
            registry: RwLock::new(Registry { confs, paths }),
        }
    }

    /// Subscribe to ready / not-ready lifecycle events.
    #[must_use]
    pub fn subscribe_events(&self) -> tokio::sync::mpsc::Receiver<PathEvent> {
        self.events.subscribe()
    }

    async fn authenticate(&self, request: &AccessRequest) -> Result<()> {
        if let Err(e) = self.auth.authenticate(request).await {
            tokio::time::sleep(AUTH_DENIED_PAUSE).await;
            return Err(e);
        }
        Ok(())
    }

    /// Bind a publisher to the path named in the request, instantiating the
    /// path if a pattern entry matches it.
    pub async fn add_publisher(&self, request: AccessRequest) -> Result<PublisherHandle> {
        self.authenticate(&request).await?;

        let name = request.path_name;
        let mut registry = self.registry.write().await;
        if !registry.paths.contains_key(&name) {
            let conf = registry
                .confs
                .find(&name)
                .cloned()
                .ok_or_else(|| Error::PathNotConfigured(name.clone()))?;
            let slot = PathSlot {
                path: Path::new(name.clone(), Arc::clone(&conf), Arc::clone(&self.events)),
                conf_name: conf.name.clone(),
            };
            registry.paths.insert(name.clone(), slot);
        }
        registry.paths[&name].path.add_publisher()
    }

    /// Route a reader to a live path.
    pub async fn add_reader(&self, request: AccessRequest) -> Result<(Arc<Path>, Arc<Stream>)> {
        self.authenticate(&request).await?;

        let registry = self.registry.read().await;
        match registry.paths.get(&request.path_name) {
            Some(slot) => slot.path.add_reader(),
            None => {
                if registry.confs.find(&request.path_name).is_some() {
                    Err(Error::PathNotReady(request.path_name))
                } else {
                    Err(Error::PathNotConfigured(request.path_name))
                }
            }
        }
    }

    /// Remove a reader from a path. Never fails.
    pub async fn remove_reader(&self, path_name: &str, reader_id: Uuid) {
        let registry = self.registry.read().await;
        if let Some(slot) = registry.paths.get(path_name) {
            slot.path.remove_reader(reader_id);
        }
    }

    /// All live paths, in no particular order.
    pub async fn api_paths_list(&self) -> Vec<PathInfo> {
        let registry = self.registry.read().await;
        registry
            .paths
            .values()
            .map(|slot| PathInfo {
                name: slot.path.name().to_string(),
                conf_name: slot.conf_name.clone(),
                ready: slot.path.ready(),
                bytes_received: slot.path.bytes_received(),
            })
            .collect()
    }

    pub async fn api_paths_get(&self, name: &str) -> Result<PathInfo> {
        let registry = self.registry.read().await;
        let slot = registry
            .paths
            .get(name)
            .ok_or_else(|| Error::PathNotFound(name.to_string()))?;
        Ok(PathInfo {
            name: slot.path.name().to_string(),
            conf_name: slot.conf_name.clone(),
            ready: slot.path.ready(),
            bytes_received: slot.path.bytes_received(),
        })
    }

    /// The current stream of a path, for the recording subsystem.
    pub async fn get_stream_for_recording(&self, name: &str) -> Result<Arc<Stream>> {
        let registry = self.registry.read().await;
        let slot = registry
            .paths
            .get(name)
            .ok_or_else(|| Error::PathNotFound(name.to_string()))?;
        slot.path
            .stream()
            .ok_or_else(|| Error::PathNotReady(name.to_string()))
    }

    /// Direct path access for collaborators that hold configuration
    /// snapshots (snapshot service, health checker).
    pub async fn get_path(&self, name: &str) -> Option<Arc<Path>> {
        let registry = self.registry.read().await;
        registry.paths.get(name).map(|s| Arc::clone(&s.path))
    }

    /// Apply a new configuration set.
    ///
    /// Paths whose governing entry changed are closed and (for static names)
    /// re-opened with the new configuration; removed entries close their
    /// paths; new static entries are added. An unchanged entry leaves its
    /// path untouched, publishers included. This is the only lifecycle
    /// event that may drop publishers.
    pub async fn reload_path_confs(&self, new: PathConfSet) {
        let mut registry = self.registry.write().await;

        let mut closed = 0usize;
        let names: Vec<String> = registry.paths.keys().cloned().collect();
        for name in names {
            let conf_name = registry.paths[&name].conf_name.clone();
            let old_conf = registry.paths[&name].path.safe_conf();
            match new.get_exact(&conf_name) {
                Some(new_conf) if **new_conf == *old_conf => {} // untouched
                Some(new_conf) => {
                    registry.paths[&name].path.terminate();
                    closed += 1;
                    let is_static = !new_conf.is_regex()
                        && new_conf.name != streamvault_core::config::ALL_OTHERS;
                    if is_static {
                        let slot = PathSlot {
                            path: Path::new(
                                name.clone(),
                                Arc::clone(new_conf),
                                Arc::clone(&self.events),
                            ),
                            conf_name: conf_name.clone(),
                        };
                        registry.paths.insert(name.clone(), slot);
                    } else {
                        registry.paths.remove(&name);
                    }
                }
                None => {
                    registry.paths[&name].path.terminate();
                    registry.paths.remove(&name);
                    closed += 1;
                }
            }
        }

        for name in new.static_names() {
            if !registry.paths.contains_key(name) {
                let conf = Arc::clone(new.get_exact(name).expect("static name exists"));
                let slot = PathSlot {
                    path: Path::new(name.to_string(), conf, Arc::clone(&self.events)),
                    conf_name: name.to_string(),
                };
                registry.paths.insert(name.to_string(), slot);
            }
        }

        registry.confs = new;
        info!(closed, total = registry.paths.len(), "path configurations reloaded");
    }

    /// Close every path. Terminal.
    pub async fn close(&self) {
        let mut registry = self.registry.write().await;
        for slot in registry.paths.values() {
            slot.path.terminate();
        }
        registry.paths.clear();
        info!("path manager closed");
    }
}
