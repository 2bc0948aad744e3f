//! Worker pool supervision.
//!
//! # Responsibilities
//! - Spawn `workers.count` workers on the shared listening socket
//! - Replace every worker that exits, with the next generation number
//! - Stop all workers on reload (each is then replaced) and on shutdown
//! - Publish a status snapshot for the `status` and `connections` commands
//! - Run the configured sidecar process for as long as the pool runs
//!
//! # Design Decisions
//! - A worker that cannot build its kernel is fatal for the whole server;
//!   respawning it would only fail again in a tight loop
//! - Exit events carry the generation, so a late event from a replaced
//!   worker never removes its successor
//! - The snapshot is written to a temp file and renamed into place

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch};

use super::sidecar::Sidecar;
use super::worker::{spawn_worker, ExitReason, WorkerEvent, WorkerHandle, WorkerSpec};
use crate::config::ServerConfig;
use crate::kernel::KernelFactory;
use crate::observability::metrics;

const STATUS_INTERVAL: Duration = Duration::from_secs(1);

/// Extra time given to worker threads beyond their own drain deadline.
const EXIT_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("failed to spawn worker thread")]
    Spawn(#[source] std::io::Error),
    #[error("worker {0} failed to start")]
    WorkerStartup(usize),
    #[error("listener address unavailable")]
    Listener(#[source] std::io::Error),
}

/// Per-worker line of the status snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub id: usize,
    pub generation: u64,
    pub requests: u64,
    pub connections: u64,
    pub started_at: u64,
}

/// What the running server publishes about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub pid: u32,
    pub address: String,
    pub started_at: u64,
    pub updated_at: u64,
    pub max_requests: u64,
    pub workers: Vec<WorkerStatus>,
}

impl StatusSnapshot {
    pub fn total_connections(&self) -> u64 {
        self.workers.iter().map(|w| w.connections).sum()
    }

    pub fn total_requests(&self) -> u64 {
        self.workers.iter().map(|w| w.requests).sum()
    }
}

fn unix_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Write `snapshot` to `path` without ever exposing a half-written file.
pub fn write_status(path: &Path, snapshot: &StatusSnapshot) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_vec_pretty(snapshot).map_err(std::io::Error::other)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)
}

pub struct Supervisor {
    config: Arc<ServerConfig>,
    factory: Arc<dyn KernelFactory>,
    started_at: SystemTime,
}

impl Supervisor {
    pub fn new(config: ServerConfig, factory: Arc<dyn KernelFactory>) -> Self {
        Self {
            config: Arc::new(config),
            factory,
            started_at: SystemTime::now(),
        }
    }

    fn spawn(
        &self,
        id: usize,
        generation: u64,
        listener: &Arc<std::net::TcpListener>,
        events: &mpsc::UnboundedSender<WorkerEvent>,
    ) -> Result<WorkerHandle, SupervisorError> {
        let handle = spawn_worker(WorkerSpec {
            id,
            generation,
            config: Arc::clone(&self.config),
            factory: Arc::clone(&self.factory),
            listener: Arc::clone(listener),
            events: events.clone(),
        })
        .map_err(SupervisorError::Spawn)?;
        tracing::debug!(worker = id, generation, "Worker spawned");
        Ok(handle)
    }

    fn snapshot(&self, address: SocketAddr, slots: &[Option<WorkerHandle>]) -> StatusSnapshot {
        StatusSnapshot {
            pid: std::process::id(),
            address: address.to_string(),
            started_at: unix_secs(self.started_at),
            updated_at: unix_secs(SystemTime::now()),
            max_requests: self.config.workers.max_requests,
            workers: slots
                .iter()
                .flatten()
                .map(|worker| WorkerStatus {
                    id: worker.id(),
                    generation: worker.generation(),
                    requests: worker.stats().handled(),
                    connections: worker.stats().active(),
                    started_at: unix_secs(worker.stats().started_at),
                })
                .collect(),
        }
    }

    /// Run the pool until `shutdown` fires, then stop every worker and wait
    /// for them (bounded by the shutdown timeout).
    pub async fn run(
        self,
        listener: std::net::TcpListener,
        mut reload: mpsc::Receiver<()>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), SupervisorError> {
        let address = listener.local_addr().map_err(SupervisorError::Listener)?;
        let listener = Arc::new(listener);
        let status_path = self.config.status_file();
        let (events_tx, mut events) = mpsc::unbounded_channel();

        let count = self.config.workers.count;
        let mut slots: Vec<Option<WorkerHandle>> = Vec::with_capacity(count);
        for id in 0..count {
            slots.push(Some(self.spawn(id, 0, &listener, &events_tx)?));
        }
        tracing::info!(
            workers = count,
            max_requests = self.config.workers.max_requests,
            address = %address,
            "Supervisor started"
        );

        let (sidecar_stop, sidecar_rx) = watch::channel(false);
        let sidecar = self.config.lifecycle.sidecar.clone().map(|config| {
            let sidecar = Sidecar::new(config, self.config.app.project_dir.clone());
            tokio::spawn(sidecar.run(sidecar_rx))
        });

        let mut status_tick = tokio::time::interval(STATUS_INTERVAL);
        let result = loop {
            tokio::select! {
                Some(WorkerEvent::Exited { id, generation, reason }) = events.recv() => {
                    let current = slots.get(id).and_then(Option::as_ref).map(WorkerHandle::generation);
                    if current != Some(generation) {
                        tracing::debug!(worker = id, generation, "Ignoring exit of replaced worker");
                        continue;
                    }
                    slots[id] = None;
                    metrics::record_worker_recycle(reason.as_str());

                    if reason == ExitReason::StartupFailed {
                        tracing::error!(worker = id, "Worker failed to start, shutting down");
                        break Err(SupervisorError::WorkerStartup(id));
                    }
                    tracing::info!(
                        worker = id,
                        generation,
                        reason = reason.as_str(),
                        "Worker exited, starting replacement"
                    );
                    match self.spawn(id, generation + 1, &listener, &events_tx) {
                        Ok(handle) => slots[id] = Some(handle),
                        Err(e) => break Err(e),
                    }
                }
                Some(()) = reload.recv() => {
                    tracing::info!(workers = count, "Reloading workers");
                    for worker in slots.iter().flatten() {
                        worker.stop();
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("Shutdown requested, stopping workers");
                    break Ok(());
                }
                _ = status_tick.tick() => {
                    if let Err(e) = write_status(&status_path, &self.snapshot(address, &slots)) {
                        tracing::warn!(path = %status_path.display(), error = %e, "Failed to write status file");
                    }
                }
            }
        };

        for worker in slots.iter().flatten() {
            worker.stop();
        }
        let _ = sidecar_stop.send(true);
        let deadline = Duration::from_secs(self.config.lifecycle.shutdown_timeout_secs) + EXIT_GRACE;
        let drained = tokio::time::timeout(deadline, async {
            while slots.iter().any(Option::is_some) {
                let Some(WorkerEvent::Exited { id, generation, .. }) = events.recv().await else {
                    break;
                };
                if slots.get(id).and_then(Option::as_ref).map(WorkerHandle::generation) == Some(generation) {
                    slots[id] = None;
                }
            }
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                remaining = slots.iter().flatten().count(),
                "Workers did not stop before the deadline"
            );
        }

        if let Some(task) = sidecar {
            if tokio::time::timeout(deadline, task).await.is_err() {
                tracing::warn!("Sidecar did not stop before the deadline");
            }
        }

        if let Err(e) = std::fs::remove_file(&status_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %status_path.display(), error = %e, "Failed to remove status file");
            }
        }
        tracing::info!("Supervisor stopped");
        result
    }
}
