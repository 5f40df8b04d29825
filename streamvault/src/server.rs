//! Server lifecycle management
//!
//! Builds the component graph in dependency order (path manager first), and
//! tears it down in reverse: health checker, API, recording manager, path
//! manager, cleaner. Protocol servers attach to the path manager through
//! `add_publisher` / `add_reader` and are deployed separately.

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use streamvault_api::{create_router, AppState};
use streamvault_core::Config;
use streamvault_recorder::{
    ColorChecker, Cleaner, HealthChecker, HttpSnapshotClient, Manager as RecordManager,
};
use streamvault_stream::PathManager;

pub struct Core {
    path_manager: Arc<PathManager>,
    record_manager: Arc<RecordManager>,
    cleaner: Arc<Cleaner>,
    health_checker: Option<Arc<HealthChecker>>,
    api_handle: JoinHandle<()>,
    api_shutdown: tokio::sync::watch::Sender<bool>,
}

impl Core {
    pub async fn new(config: Config) -> Result<Self> {
        let path_confs = config.path_conf_set()?;
        let record_root = PathBuf::from(&config.server.record_path);

        let path_manager = Arc::new(PathManager::new(path_confs.clone(), None));

        let cleaner = Cleaner::spawn(record_root.clone(), path_confs.clone());

        let record_manager = RecordManager::spawn(
            record_root,
            config.server.api_base_url(),
            path_confs.clone(),
            config.path_defaults.clone(),
            Arc::clone(&path_manager),
        );

        // Smart recording and health checks need the snapshot service; both
        // degrade gracefully when it is not deployed.
        let health_checker = match &config.server.snapshot_service_url {
            Some(url) => {
                let snapshot = Arc::new(HttpSnapshotClient::new(url.clone()));
                let color_checker = Arc::clone(&snapshot) as Arc<dyn ColorChecker>;
                record_manager
                    .initialize_smart_recording(color_checker)
                    .await;
                Some(HealthChecker::spawn(&path_confs, snapshot))
            }
            None => {
                warn!("no snapshot service configured; smart recording and health checks disabled");
                None
            }
        };

        let (api_handle, api_shutdown) = serve_api(
            &config.server.api_address,
            AppState {
                path_manager: Arc::clone(&path_manager),
                record_manager: Arc::clone(&record_manager),
            },
        )
        .await?;

        Ok(Self {
            path_manager,
            record_manager,
            cleaner,
            health_checker,
            api_handle,
            api_shutdown,
        })
    }

    /// Run until a shutdown signal arrives, applying configuration reloads
    /// on SIGHUP along the way, then close everything.
    pub async fn run(self) -> Result<()> {
        loop {
            tokio::select! {
                () = shutdown_signal() => {
                    info!("shutdown signal received, stopping server...");
                    break;
                }
                reload = reload_signal() => {
                    if reload {
                        self.apply_reload().await;
                    }
                }
            }
        }
        self.close().await;
        info!("server shut down gracefully");
        Ok(())
    }

    async fn apply_reload(&self) {
        info!("reloading configuration (signal)");
        match Config::load(std::env::args().nth(1).as_deref()) {
            Ok(new_config) if new_config.validate().is_ok() => {
                match new_config.path_conf_set() {
                    Ok(new_confs) => {
                        self.path_manager.reload_path_confs(new_confs.clone()).await;
                        self.record_manager.reload_path_confs(new_confs.clone()).await;
                        self.cleaner.reload_path_confs(new_confs.clone()).await;
                        if let Some(checker) = &self.health_checker {
                            checker.reload_path_confs(&new_confs);
                        }
                        info!("configuration reloaded");
                    }
                    Err(e) => error!(error = %e, "reload rejected: invalid path configuration"),
                }
            }
            Ok(_) => error!("reload rejected: configuration failed validation"),
            Err(e) => error!("reload rejected: {e}"),
        }
    }

    /// Close-cascade in reverse dependency order.
    async fn close(self) {
        if let Some(checker) = &self.health_checker {
            checker.close();
        }

        let _ = self.api_shutdown.send(true);
        if let Err(e) = self.api_handle.await {
            error!(error = %e, "API server task failed");
        }

        self.record_manager.close().await;
        self.path_manager.close().await;
        self.cleaner.close();
    }
}

async fn serve_api(
    address: &str,
    state: AppState,
) -> Result<(JoinHandle<()>, tokio::sync::watch::Sender<bool>)> {
    let listener = tokio::net::TcpListener::bind(address).await?;
    info!("API listening on http://{address}");

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);
    let router = create_router(state);

    let handle = tokio::spawn(async move {
        let shutdown = async move {
            let _ = shutdown_rx.changed().await;
        };
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
        {
            error!(error = %e, "API server error");
        }
    });

    Ok((handle, shutdown_tx))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

/// Resolves true on SIGHUP (configuration reload); never resolves on
/// platforms without it.
async fn reload_signal() -> bool {
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
            Ok(mut hangup) => {
                hangup.recv().await;
                true
            }
            Err(_) => std::future::pending().await,
        }
    }
    #[cfg(not(unix))]
    {
        std::future::pending().await
    }
}
