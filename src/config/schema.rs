//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the server.
//! All types derive Serde traits for deserialization from config files.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration for the resident server.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Listener configuration (bind address, limits).
    pub listener: ListenerConfig,

    /// Worker pool sizing and recycling.
    pub workers: WorkerConfig,

    /// Application bridging (document root, handler chain, proxy trust).
    pub app: AppConfig,

    /// Process lifecycle (PID file, status snapshot, reload watcher).
    pub lifecycle: LifecycleConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "127.0.0.1:8080").
    pub bind_address: String,

    /// Maximum concurrent connections per worker (backpressure).
    pub max_connections: usize,

    /// Idle keep-alive connections are closed after this many seconds.
    pub idle_timeout_secs: u64,

    /// Upper bound for the request line plus headers.
    pub max_header_bytes: usize,

    /// Upper bound for a request body.
    pub max_body_bytes: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8080".to_string(),
            max_connections: 10_000,
            idle_timeout_secs: 60,
            max_header_bytes: 64 * 1024,
            max_body_bytes: 8 * 1024 * 1024,
        }
    }
}

/// What the orchestrator does with a failure that escaped every inner boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Log, answer 500 if nothing was sent yet, keep serving.
    #[default]
    Respond,
    /// Log, drop the connection and stop this worker so it is replaced.
    Recycle,
}

/// Worker pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of worker threads, each with its own kernel.
    pub count: usize,

    /// Requests a worker serves before it asks to be replaced.
    pub max_requests: u64,

    /// Top-level failure policy.
    pub failure_policy: FailurePolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
            max_requests: 10_000,
            failure_policy: FailurePolicy::Respond,
        }
    }
}

/// Half the logical cores, never fewer than two.
pub fn default_worker_count() -> usize {
    (num_cpus::get() / 2).max(2)
}

/// A handler that can be placed in the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerKind {
    Static,
    Health,
    Application,
}

/// Application bridging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    /// Project directory; static files are served from `{project_dir}/public`.
    pub project_dir: PathBuf,

    /// Handler chain composition, tried in order.
    pub handlers: Vec<HandlerKind>,

    /// Try static files before entering the chain at all.
    pub static_fast_path: bool,

    /// Header an upstream TLS proxy sets to mark the request as HTTPS.
    pub https_header: Option<String>,

    /// Header an upstream proxy sets to carry the real client address.
    pub real_ip_header: Option<String>,

    /// Include error details in 500 bodies produced from kernel failures.
    pub debug: bool,

    /// Honor the `debug-dump-*` query flags.
    pub debug_dumps: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            project_dir: PathBuf::from("."),
            handlers: vec![
                HandlerKind::Static,
                HandlerKind::Health,
                HandlerKind::Application,
            ],
            static_fast_path: true,
            https_header: Some("Force-Https".to_string()),
            real_ip_header: Some("X-Real-IP".to_string()),
            debug: false,
            debug_dumps: false,
        }
    }
}

impl AppConfig {
    /// Directory static files are served from.
    pub fn document_root(&self) -> PathBuf {
        self.project_dir.join("public")
    }
}

/// Process lifecycle configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// PID file; defaults to `{project_dir}/var/resident-server.pid`.
    pub pid_file: Option<PathBuf>,

    /// Status snapshot; defaults to `{project_dir}/var/resident-server.status.json`.
    pub status_file: Option<PathBuf>,

    /// Forced exit deadline for graceful shutdown.
    pub shutdown_timeout_secs: u64,

    /// Paths whose changes trigger a worker reload. Empty disables the watcher.
    pub watch_paths: Vec<PathBuf>,

    /// Companion process run and restarted next to the workers
    /// (a queue consumer, for example).
    pub sidecar: Option<SidecarConfig>,
}

/// A long-running companion process supervised with the workers.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SidecarConfig {
    /// Name used in logs and exported as `WORKER_NAME` to the process.
    pub name: String,

    /// Program followed by its arguments, run from `app.project_dir`.
    pub command: Vec<String>,

    /// Pause before a process that exited is started again.
    pub restart_delay_ms: u64,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            name: "sidecar".to_string(),
            command: Vec::new(),
            restart_delay_ms: 1000,
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            pid_file: None,
            status_file: None,
            shutdown_timeout_secs: 10,
            watch_paths: Vec::new(),
            sidecar: None,
        }
    }
}

impl ServerConfig {
    pub fn pid_file(&self) -> PathBuf {
        self.lifecycle
            .pid_file
            .clone()
            .unwrap_or_else(|| self.app.project_dir.join("var").join("resident-server.pid"))
    }

    pub fn status_file(&self) -> PathBuf {
        self.lifecycle.status_file.clone().unwrap_or_else(|| {
            self.app
                .project_dir
                .join("var")
                .join("resident-server.status.json")
        })
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Human-readable or JSON log lines.
    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
