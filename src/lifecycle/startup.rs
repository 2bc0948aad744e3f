//! Startup orchestration.
//!
//! # Responsibilities
//! - Claim the PID file
//! - Start the metrics exporter when enabled
//! - Bind the listening socket once for every worker
//! - Install signal handlers and the code watcher
//! - Run the supervisor until shutdown
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Subsystems initialize in order, not concurrently
//! - The socket is bound last, so traffic only arrives once everything else is ready

use std::sync::Arc;

use notify::RecommendedWatcher;
use tokio::sync::mpsc;

use super::pidfile::{PidFile, PidFileError};
use super::shutdown::Shutdown;
use super::signals::spawn_signal_handler;
use super::supervisor::{Supervisor, SupervisorError};
use super::watcher::CodeWatcher;
use crate::config::ServerConfig;
use crate::kernel::KernelFactory;
use crate::net::{bind_shared, ListenerError};
use crate::observability::metrics;

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    PidFile(#[from] PidFileError),
    #[error("failed to bind listener")]
    Listener(#[from] ListenerError),
    #[error("failed to install signal handlers")]
    Signals(#[source] std::io::Error),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}

fn start_metrics(config: &ServerConfig) {
    if !config.observability.metrics_enabled {
        return;
    }
    match config.observability.metrics_address.parse() {
        Ok(addr) => {
            if let Err(e) = metrics::init_metrics(addr) {
                tracing::error!(error = %e, "Failed to start metrics exporter");
            }
        }
        Err(_) => tracing::error!(
            metrics_address = %config.observability.metrics_address,
            "Failed to parse metrics address"
        ),
    }
}

fn start_watcher(config: &ServerConfig, reload_tx: mpsc::Sender<()>) -> Option<RecommendedWatcher> {
    let paths = config.lifecycle.watch_paths.clone();
    if paths.is_empty() {
        return None;
    }
    match CodeWatcher::new(paths, reload_tx).run() {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            tracing::warn!(error = %e, "Code watcher unavailable, continuing without it");
            None
        }
    }
}

/// Serve until SIGTERM/SIGINT, then drain and return.
///
/// Must be called from inside a multi-threaded Tokio runtime.
pub async fn serve(config: ServerConfig, factory: Arc<dyn KernelFactory>) -> Result<(), StartupError> {
    let _pid_file = PidFile::create(&config.pid_file())?;
    start_metrics(&config);

    let listener = bind_shared(&config.listener)?;

    let shutdown = Shutdown::new();
    let shutdown_rx = shutdown.subscribe();
    let (reload_tx, reload_rx) = mpsc::channel(1);
    let signals = spawn_signal_handler(shutdown, reload_tx.clone()).map_err(StartupError::Signals)?;
    let _watcher = start_watcher(&config, reload_tx);

    tracing::info!(
        workers = config.workers.count,
        project_dir = %config.app.project_dir.display(),
        "Server starting"
    );
    let result = Supervisor::new(config, factory)
        .run(listener, reload_rx, shutdown_rx)
        .await;

    signals.abort();
    result.map_err(Into::into)
}
