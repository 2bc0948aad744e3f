//! OS signal handling.
//!
//! # Responsibilities
//! - Register handlers for SIGTERM, SIGINT, SIGUSR1 and SIGHUP
//! - Translate them into shutdown and reload requests
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - SIGUSR1 and SIGHUP reload workers, never shut down
//! - A repeated SIGTERM/SIGINT while draining is logged and otherwise
//!   ignored; the supervisor's own deadline bounds the drain

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::shutdown::Shutdown;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Request {
    Shutdown(&'static str),
    Reload(&'static str),
}

/// Install the handlers and spawn the task that serves them.
pub fn spawn_signal_handler(
    shutdown: Shutdown,
    reload: mpsc::Sender<()>,
) -> std::io::Result<JoinHandle<()>> {
    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;
    let mut usr1 = signal(SignalKind::user_defined1())?;
    let mut hup = signal(SignalKind::hangup())?;

    Ok(tokio::spawn(async move {
        let mut draining = false;
        loop {
            let request = tokio::select! {
                Some(()) = term.recv() => Request::Shutdown("SIGTERM"),
                Some(()) = int.recv() => Request::Shutdown("SIGINT"),
                Some(()) = usr1.recv() => Request::Reload("SIGUSR1"),
                Some(()) = hup.recv() => Request::Reload("SIGHUP"),
                else => break,
            };
            match request {
                Request::Reload(name) => {
                    tracing::info!(signal = name, "Reload requested");
                    if reload.try_send(()).is_err() {
                        tracing::debug!("Reload already pending");
                    }
                }
                Request::Shutdown(name) if draining => {
                    tracing::warn!(signal = name, "Already shutting down");
                }
                Request::Shutdown(name) => {
                    tracing::info!(signal = name, "Shutdown requested");
                    draining = true;
                    shutdown.trigger();
                }
            }
        }
    }))
}
