//! Companion process supervised next to the workers.
//!
//! # Responsibilities
//! - Start the configured command from the project directory
//! - Start it again, after a pause, whenever it exits
//! - On stop, send SIGTERM and kill it if it outlives the grace period
//!
//! # Design Decisions
//! - A command that cannot be spawned is retried like one that exited;
//!   the HTTP workers keep serving either way

use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::watch;

use super::pidfile::send_signal;
use crate::config::SidecarConfig;

/// How long a stopping sidecar may take after SIGTERM.
const STOP_GRACE: Duration = Duration::from_secs(5);

pub struct Sidecar {
    config: SidecarConfig,
    project_dir: PathBuf,
}

impl Sidecar {
    pub fn new(config: SidecarConfig, project_dir: impl Into<PathBuf>) -> Self {
        Self {
            config,
            project_dir: project_dir.into(),
        }
    }

    fn spawn(&self) -> std::io::Result<Child> {
        let (program, args) = self
            .config
            .command
            .split_first()
            .ok_or_else(|| std::io::Error::other("sidecar command is empty"))?;
        Command::new(program)
            .args(args)
            .current_dir(&self.project_dir)
            .env("WORKER_NAME", &self.config.name)
            .kill_on_drop(true)
            .spawn()
    }

    /// Keep the process running until `stop` turns true.
    ///
    /// Returns how many times the process was started.
    pub async fn run(self, mut stop: watch::Receiver<bool>) -> u64 {
        let name = self.config.name.as_str();
        let delay = Duration::from_millis(self.config.restart_delay_ms);
        let mut starts = 0;

        while !*stop.borrow() {
            match self.spawn() {
                Ok(mut child) => {
                    starts += 1;
                    tracing::info!(sidecar = name, pid = child.id(), starts, "Sidecar started");
                    tokio::select! {
                        status = child.wait() => log_exit(name, status),
                        _ = async { let _ = stop.wait_for(|stopped| *stopped).await; } => {
                            terminate(name, &mut child).await;
                            break;
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(sidecar = name, error = %e, "Failed to start sidecar");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stop.wait_for(|stopped| *stopped) => break,
            }
        }

        tracing::info!(sidecar = name, starts, "Sidecar stopped");
        starts
    }
}

fn log_exit(name: &str, status: std::io::Result<ExitStatus>) {
    match status {
        Ok(status) => tracing::warn!(sidecar = name, %status, "Sidecar exited, restarting"),
        Err(e) => tracing::error!(sidecar = name, error = %e, "Lost track of sidecar, restarting"),
    }
}

async fn terminate(name: &str, child: &mut Child) {
    if let Some(pid) = child.id() {
        if let Err(e) = send_signal(pid as i32, libc::SIGTERM) {
            tracing::debug!(sidecar = name, error = %e, "SIGTERM not delivered");
        }
    }
    if tokio::time::timeout(STOP_GRACE, child.wait()).await.is_err() {
        tracing::warn!(sidecar = name, "Sidecar ignored SIGTERM, killing it");
        if let Err(e) = child.kill().await {
            tracing::error!(sidecar = name, error = %e, "Failed to kill sidecar");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn shell(script: &str, restart_delay_ms: u64) -> SidecarConfig {
        SidecarConfig {
            name: "consumer".into(),
            command: vec!["sh".into(), "-c".into(), script.into()],
            restart_delay_ms,
        }
    }

    #[tokio::test]
    async fn exited_process_is_started_again() {
        let dir = tempfile::tempdir().unwrap();
        let sidecar = Sidecar::new(shell("echo \"$WORKER_NAME\" >> runs.log", 20), dir.path());
        let (stop_tx, stop_rx) = watch::channel(false);
        let run = tokio::spawn(sidecar.run(stop_rx));

        let log = dir.path().join("runs.log");
        let mut runs = 0;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            runs = std::fs::read_to_string(&log).map(|s| s.lines().count()).unwrap_or(0);
            if runs >= 3 {
                break;
            }
        }
        assert!(runs >= 3, "ran {runs} times");
        assert!(std::fs::read_to_string(&log).unwrap().starts_with("consumer\n"));

        stop_tx.send(true).unwrap();
        let starts = tokio::time::timeout(Duration::from_secs(5), run).await.unwrap().unwrap();
        assert!(starts >= 3);
    }

    #[tokio::test]
    async fn stop_terminates_a_running_process() {
        let dir = tempfile::tempdir().unwrap();
        let sidecar = Sidecar::new(shell("exec sleep 30", 20), dir.path());
        let (stop_tx, stop_rx) = watch::channel(false);
        let run = tokio::spawn(sidecar.run(stop_rx));

        tokio::time::sleep(Duration::from_millis(200)).await;
        let started = Instant::now();
        stop_tx.send(true).unwrap();
        let starts = tokio::time::timeout(Duration::from_secs(10), run).await.unwrap().unwrap();

        assert_eq!(starts, 1);
        assert!(started.elapsed() < STOP_GRACE);
    }

    #[tokio::test]
    async fn missing_program_does_not_stop_the_loop() {
        let config = SidecarConfig {
            name: "ghost".into(),
            command: vec!["/definitely/not/a/program".into()],
            restart_delay_ms: 10,
        };
        let (stop_tx, stop_rx) = watch::channel(false);
        let run = tokio::spawn(Sidecar::new(config, ".").run(stop_rx));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!run.is_finished());
        stop_tx.send(true).unwrap();
        assert_eq!(run.await.unwrap(), 0);
    }
}
