//! Commands aimed at an already running server: stop, reload, status.
//!
//! The server is found through its PID file; status data comes from the
//! snapshot the supervisor rewrites every second.

use std::fmt::Write as _;
use std::path::PathBuf;
use std::time::Duration;

use super::pidfile::{is_alive, read_pid, send_signal};
use super::supervisor::StatusSnapshot;
use crate::config::ServerConfig;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Time allowed beyond the server's own shutdown timeout before `stop` gives up.
const STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("server is not running (no live pid in {})", .0.display())]
    NotRunning(PathBuf),
    #[error("failed to signal pid {pid}")]
    Signal {
        pid: i32,
        #[source]
        source: std::io::Error,
    },
    #[error("pid {pid} did not exit within {waited:?}")]
    StopTimeout { pid: i32, waited: Duration },
    #[error("status file unavailable")]
    Io(#[from] std::io::Error),
    #[error("status file is not valid JSON")]
    Status(#[from] serde_json::Error),
}

/// PID of the running server, if the PID file names a live process.
pub fn running_pid(config: &ServerConfig) -> Result<i32, ControlError> {
    let path = config.pid_file();
    match read_pid(&path)? {
        Some(pid) if is_alive(pid) => Ok(pid),
        _ => Err(ControlError::NotRunning(path)),
    }
}

fn signal(pid: i32, signal: libc::c_int) -> Result<(), ControlError> {
    send_signal(pid, signal).map_err(|source| ControlError::Signal { pid, source })
}

/// Ask the server to shut down gracefully and wait until it is gone.
pub async fn stop(config: &ServerConfig) -> Result<i32, ControlError> {
    let pid = running_pid(config)?;
    signal(pid, libc::SIGTERM)?;
    tracing::debug!(pid, "SIGTERM sent");

    let waited = Duration::from_secs(config.lifecycle.shutdown_timeout_secs) + STOP_GRACE;
    let exited = tokio::time::timeout(waited, async {
        while is_alive(pid) {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    })
    .await;
    match exited {
        Ok(()) => Ok(pid),
        Err(_) => Err(ControlError::StopTimeout { pid, waited }),
    }
}

/// Ask the server to replace all of its workers.
pub fn reload(config: &ServerConfig) -> Result<i32, ControlError> {
    let pid = running_pid(config)?;
    signal(pid, libc::SIGUSR1)?;
    Ok(pid)
}

pub fn read_status(config: &ServerConfig) -> Result<StatusSnapshot, ControlError> {
    let bytes = std::fs::read(config.status_file())?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Human-readable summary of the server and its workers.
pub fn status_report(config: &ServerConfig) -> Result<String, ControlError> {
    let pid = match running_pid(config) {
        Ok(pid) => pid,
        Err(ControlError::NotRunning(_)) => return Ok("resident-server is not running".to_string()),
        Err(e) => return Err(e),
    };
    let snapshot = read_status(config)?;

    let mut report = String::new();
    let _ = writeln!(report, "resident-server is running (pid {pid})");
    let _ = writeln!(report, "listening on {}", snapshot.address);
    let _ = writeln!(
        report,
        "workers: {}, max requests per worker: {}",
        snapshot.workers.len(),
        snapshot.max_requests
    );
    for worker in &snapshot.workers {
        let _ = writeln!(
            report,
            "  worker {:<3} generation {:<5} requests {:<8} connections {}",
            worker.id, worker.generation, worker.requests, worker.connections
        );
    }
    let _ = write!(report, "total requests: {}", snapshot.total_requests());
    Ok(report)
}

/// Open connections per worker.
pub fn connections_report(snapshot: &StatusSnapshot) -> String {
    let mut report = String::new();
    for worker in &snapshot.workers {
        let _ = writeln!(report, "worker {}: {} connections", worker.id, worker.connections);
    }
    let _ = write!(report, "total: {} connections", snapshot.total_connections());
    report
}
