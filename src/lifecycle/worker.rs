//! One worker: an OS thread with its own single-threaded runtime.
//!
//! # Responsibilities
//! - Build the worker's kernel, handler chain, guard and orchestrator
//! - Accept connections from the shared listening socket
//! - Serve keep-alive connections, one message at a time per connection
//! - Stop when asked, or when the orchestrator reports a ceiling or failure
//! - Drain open connections, then report its exit to the supervisor
//!
//! # Design Decisions
//! - The kernel is `Rc` and never leaves the thread; only the factory is shared
//! - A stop request is a `watch` flag: the accept loop breaks at once, idle
//!   keep-alive connections close, busy ones finish their current message,
//!   and just-accepted ones are still answered once
//! - Every exit path sends exactly one `WorkerEvent::Exited`, panics included

use std::cell::Cell;
use std::panic::AssertUnwindSafe;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::BytesMut;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::LocalSet;
use tracing::Instrument;

use crate::config::{HandlerKind, ServerConfig};
use crate::handler::{build_chain, StaticFiles};
use crate::http::encode::ConnectionAction;
use crate::http::server::{framing_error_emission, Orchestrator, StopReason};
use crate::kernel::{panic_message, Kernel, KernelFactory};
use crate::lifecycle::guard::LifecycleGuard;
use crate::net::{
    read_request, write_emission, Accepted, ConnectionInfo, ConnectionTracker, WireLimits,
    WorkerListener,
};

/// Pause after a failed accept (fd exhaustion, mostly) before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Why a worker thread ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The supervisor asked it to stop (reload or shutdown).
    Stopped,
    /// It handled `max_requests` requests.
    RequestCeiling,
    /// A request failed under the `recycle` policy.
    Failure,
    /// Kernel construction or listener registration failed.
    StartupFailed,
    /// The worker thread itself panicked.
    Panicked,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::Stopped => "stopped",
            ExitReason::RequestCeiling => "request_ceiling",
            ExitReason::Failure => "failure",
            ExitReason::StartupFailed => "startup_failed",
            ExitReason::Panicked => "panicked",
        }
    }
}

impl From<StopReason> for ExitReason {
    fn from(reason: StopReason) -> Self {
        match reason {
            StopReason::RequestCeiling => ExitReason::RequestCeiling,
            StopReason::Failure => ExitReason::Failure,
        }
    }
}

/// Messages from worker threads to the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerEvent {
    Exited {
        id: usize,
        generation: u64,
        reason: ExitReason,
    },
}

/// Counters the supervisor reads from its own thread.
#[derive(Debug)]
pub struct WorkerStats {
    pub handled: AtomicU64,
    pub active: Arc<AtomicU64>,
    pub started_at: SystemTime,
}

impl WorkerStats {
    fn new() -> Self {
        Self {
            handled: AtomicU64::new(0),
            active: Arc::new(AtomicU64::new(0)),
            started_at: SystemTime::now(),
        }
    }

    pub fn handled(&self) -> u64 {
        self.handled.load(Ordering::Relaxed)
    }

    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }
}

/// Everything a worker thread needs to start.
pub struct WorkerSpec {
    pub id: usize,
    pub generation: u64,
    pub config: Arc<ServerConfig>,
    pub factory: Arc<dyn KernelFactory>,
    pub listener: Arc<std::net::TcpListener>,
    pub events: mpsc::UnboundedSender<WorkerEvent>,
}

/// Supervisor-side handle on a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    id: usize,
    generation: u64,
    stop: Arc<watch::Sender<bool>>,
    stats: Arc<WorkerStats>,
}

impl WorkerHandle {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Ask the worker to finish in-flight work and exit.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }
}

/// Start a worker thread.
pub fn spawn_worker(spec: WorkerSpec) -> std::io::Result<WorkerHandle> {
    let (stop_tx, stop_rx) = watch::channel(false);
    let stop = Arc::new(stop_tx);
    let stats = Arc::new(WorkerStats::new());
    let handle = WorkerHandle {
        id: spec.id,
        generation: spec.generation,
        stop: Arc::clone(&stop),
        stats: Arc::clone(&stats),
    };

    std::thread::Builder::new()
        .name(format!("worker-{}", spec.id))
        .spawn(move || run_thread(spec, stop, stop_rx, stats))?;
    Ok(handle)
}

fn run_thread(
    spec: WorkerSpec,
    stop: Arc<watch::Sender<bool>>,
    stop_rx: watch::Receiver<bool>,
    stats: Arc<WorkerStats>,
) {
    let (id, generation, events) = (spec.id, spec.generation, spec.events.clone());

    let reason = match std::panic::catch_unwind(AssertUnwindSafe(|| {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                tracing::error!(worker = id, error = %e, "Failed to build worker runtime");
                return ExitReason::StartupFailed;
            }
        };
        LocalSet::new().block_on(&runtime, serve(spec, stop, stop_rx, stats))
    })) {
        Ok(reason) => reason,
        Err(panic) => {
            tracing::error!(
                worker = id,
                error = %panic_message(panic.as_ref()),
                "Worker thread panicked"
            );
            ExitReason::Panicked
        }
    };

    let _ = events.send(WorkerEvent::Exited {
        id,
        generation,
        reason,
    });
}

/// The orchestrator a worker dispatches through, composed from configuration.
pub fn build_orchestrator(worker: usize, config: &ServerConfig, kernel: Rc<dyn Kernel>) -> Orchestrator {
    let app = &config.app;
    let fast_path = (app.static_fast_path && app.handlers.contains(&HandlerKind::Static))
        .then(|| StaticFiles::new(app.document_root()));
    let chain = build_chain(app, Rc::clone(&kernel), fast_path.is_some());

    let mut guard = LifecycleGuard::new(config.workers.max_requests);
    for service in kernel.resettable_services() {
        guard.register(service);
    }

    tracing::debug!(
        worker,
        handlers = ?chain.names(),
        fast_path = fast_path.is_some(),
        services = guard.services(),
        "Orchestrator ready"
    );
    Orchestrator::new(worker, chain, fast_path, guard, config.workers.failure_policy)
}

/// State shared by the connection tasks of one worker.
struct Shared {
    orchestrator: Orchestrator,
    limits: WireLimits,
    idle_timeout: Duration,
    stop: Arc<watch::Sender<bool>>,
    exit: Cell<Option<StopReason>>,
    stats: Arc<WorkerStats>,
}

impl Shared {
    fn request_stop(&self, reason: StopReason) {
        if self.exit.get().is_none() {
            self.exit.set(Some(reason));
        }
        self.stop.send_replace(true);
    }
}

async fn serve(
    spec: WorkerSpec,
    stop: Arc<watch::Sender<bool>>,
    mut stop_rx: watch::Receiver<bool>,
    stats: Arc<WorkerStats>,
) -> ExitReason {
    let span = tracing::info_span!("worker", worker = spec.id, generation = spec.generation);
    async move {
        let config = &spec.config;

        let kernel = match spec.factory.build(spec.id) {
            Ok(kernel) => kernel,
            Err(e) => {
                tracing::error!(error = %e.chain(), "Kernel construction failed");
                return ExitReason::StartupFailed;
            }
        };
        let listener = match WorkerListener::register(&spec.listener, config.listener.max_connections) {
            Ok(listener) => listener,
            Err(e) => {
                tracing::error!(error = %e, "Listener registration failed");
                return ExitReason::StartupFailed;
            }
        };

        let shared = Rc::new(Shared {
            orchestrator: build_orchestrator(spec.id, config, kernel),
            limits: WireLimits {
                max_header_bytes: config.listener.max_header_bytes,
                max_body_bytes: config.listener.max_body_bytes,
            },
            idle_timeout: Duration::from_secs(config.listener.idle_timeout_secs),
            stop: Arc::clone(&stop),
            exit: Cell::new(None),
            stats: Arc::clone(&stats),
        });
        let tracker = ConnectionTracker::new(spec.id, Arc::clone(&stats.active));

        tracing::info!("Worker started");
        loop {
            tokio::select! {
                biased;
                _ = stop_rx.wait_for(|stopping| *stopping) => break,
                accepted = listener.accept() => match accepted {
                    Ok(Accepted { stream, info, permit }) => {
                        let slot = tracker.open();
                        let span = tracing::debug_span!("connection", id = %slot.id());
                        let shared = Rc::clone(&shared);
                        tokio::task::spawn_local(
                            async move {
                                let _permit = permit;
                                let _slot = slot;
                                serve_connection(stream, info, &shared).await;
                            }
                            .instrument(span),
                        );
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                }
            }
        }
        drop(listener);

        tracing::info!(open = tracker.open_count(), "Worker stopping, draining connections");
        let deadline = Duration::from_secs(config.lifecycle.shutdown_timeout_secs);
        if !tracker.drain(deadline).await {
            tracing::warn!(open = tracker.open_count(), "Drain timed out, dropping connections");
        }

        let reason = shared.exit.get().map(ExitReason::from).unwrap_or(ExitReason::Stopped);
        tracing::info!(
            reason = reason.as_str(),
            handled = stats.handled(),
            "Worker exited"
        );
        reason
    }
    .instrument(span)
    .await
}

/// Serve one client connection until it closes, idles out, or the worker stops.
async fn serve_connection(mut stream: TcpStream, info: ConnectionInfo, shared: &Shared) {
    let mut buf = BytesMut::with_capacity(8 * 1024);
    let mut stop_rx = shared.stop.subscribe();
    let mut served = 0u64;

    loop {
        let next = tokio::time::timeout(
            shared.idle_timeout,
            read_request(&mut stream, &mut buf, &shared.limits),
        );
        // A fresh connection always gets its first request answered; only
        // idle keep-alive connections are closed by a stop.
        let read = if served == 0 {
            next.await
        } else {
            tokio::select! {
                biased;
                _ = stop_rx.wait_for(|stopping| *stopping) => {
                    tracing::trace!("Closing idle connection, worker is stopping");
                    break;
                }
                read = next => read,
            }
        };

        let raw = match read {
            Err(_) => {
                tracing::trace!("Idle timeout");
                break;
            }
            Ok(Ok(Some(raw))) => raw,
            Ok(Ok(None)) => break,
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "Unreadable request, closing connection");
                if let Some(emission) = e.status().and_then(framing_error_emission) {
                    let _ = write_emission(&mut stream, &emission).await;
                }
                break;
            }
        };

        let outcome = shared.orchestrator.on_message(&mut stream, &info, raw).await;
        shared.stats.handled.fetch_add(1, Ordering::Relaxed);
        served += 1;

        if let Some(reason) = outcome.stop {
            tracing::info!(reason = reason.as_str(), "Worker will recycle");
            shared.request_stop(reason);
            break;
        }
        if outcome.action == ConnectionAction::Close {
            break;
        }
    }

    let _ = stream.shutdown().await;
}
