//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     PID file → metrics → bind socket → signals + watcher → supervisor
//!
//! Supervision (supervisor.rs, worker.rs):
//!     N worker threads → exit event (ceiling, failure, stop) → respawn
//!     optional sidecar process (sidecar.rs) → exit → restart after a pause
//!
//! Per request (guard.rs, deferred.rs):
//!     response sent → deferred tasks → release scope → reset services → count
//!
//! Shutdown (shutdown.rs, signals.rs):
//!     SIGTERM/SIGINT → stop workers → drain connections → exit
//!     SIGUSR1/SIGHUP or code change (watcher.rs) → replace all workers
//!
//! Control (control.rs, pidfile.rs):
//!     stop / reload / status / connections against a running server
//! ```
//!
//! # Design Decisions
//! - All per-worker state lives on the worker's thread; the supervisor only
//!   sees atomics and exit events
//! - Shutdown has a timeout: workers still busy after the deadline are abandoned

pub mod control;
pub mod deferred;
pub mod guard;
pub mod pidfile;
pub mod shutdown;
pub mod sidecar;
pub mod signals;
pub mod startup;
pub mod supervisor;
pub mod watcher;
pub mod worker;

pub use deferred::DeferredTasks;
pub use guard::{LifecycleGuard, OutputCapture, RequestCounter};
pub use shutdown::Shutdown;
pub use sidecar::Sidecar;
pub use startup::{serve, StartupError};
pub use supervisor::{StatusSnapshot, Supervisor, SupervisorError};
pub use worker::{ExitReason, WorkerEvent};
