//! resident-server
//!
//! Keeps an application kernel booted across requests and serves HTTP from a
//! pool of worker threads.
//!
//! # Architecture Overview
//!
//! ```text
//!                       ┌──────────────────────────────────────────────────────┐
//!                       │                   SUPERVISOR                          │
//!                       │  pid file · signals · code watcher · status snapshot  │
//!                       └───────────────┬──────────────────────────────────────┘
//!                                       │ spawn / respawn (generation + 1)
//!              ┌────────────────────────┼────────────────────────┐
//!              ▼                        ▼                        ▼
//!     ┌─────────────────┐      ┌─────────────────┐      ┌─────────────────┐
//!     │    worker 0     │      │    worker 1     │      │    worker N     │
//!     │ runtime + kernel│      │ runtime + kernel│      │ runtime + kernel│
//!     └────────┬────────┘      └─────────────────┘      └─────────────────┘
//!              │
//!   accept ──▶ wire ──▶ decode ──▶ static fast path ──▶ handler chain ──▶ encode ──▶ send
//!                                                         (static, health,
//!                                                          application → kernel)
//!                                                                          │
//!                          count ◀── reset services ◀── release ◀── deferred ◀┘
//! ```
//!
//! # Commands
//!
//! `start` (default), `stop`, `restart`, `status`, `reload`, `connections`.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use resident_server::config::{load_config, ServerConfig};
use resident_server::kernel::EchoKernelFactory;
use resident_server::lifecycle::control::{self, ControlError};
use resident_server::observability::logging::init_logging;

#[derive(Parser)]
#[command(name = "resident-server", version, about = "Multi-worker HTTP server for a resident application kernel", long_about = None)]
struct Cli {
    /// Configuration file (TOML). Defaults apply when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Clone, Copy)]
enum Commands {
    /// Start the server in the foreground
    Start,
    /// Stop a running server gracefully
    Stop,
    /// Stop the running server (if any), then start
    Restart,
    /// Show the running server's workers
    Status,
    /// Replace all workers of the running server
    Reload,
    /// Show open connections per worker
    Connections,
}

type BoxError = Box<dyn std::error::Error>;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    match run(cli.command.unwrap_or(Commands::Start), config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            let mut source = e.source();
            while let Some(cause) = source {
                eprintln!("  caused by: {cause}");
                source = cause.source();
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands, config: ServerConfig) -> Result<(), BoxError> {
    match command {
        Commands::Start => start(config).await,
        Commands::Stop => {
            let pid = control::stop(&config).await?;
            println!("resident-server stopped (pid {pid})");
            Ok(())
        }
        Commands::Restart => {
            match control::stop(&config).await {
                Ok(pid) => println!("resident-server stopped (pid {pid})"),
                Err(ControlError::NotRunning(_)) => {}
                Err(e) => return Err(e.into()),
            }
            start(config).await
        }
        Commands::Status => {
            println!("{}", control::status_report(&config)?);
            Ok(())
        }
        Commands::Reload => {
            let pid = control::reload(&config)?;
            println!("reload signal sent to pid {pid}");
            Ok(())
        }
        Commands::Connections => {
            control::running_pid(&config)?;
            println!("{}", control::connections_report(&control::read_status(&config)?));
            Ok(())
        }
    }
}

async fn start(config: ServerConfig) -> Result<(), BoxError> {
    init_logging(&config.observability)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        bind_address = %config.listener.bind_address,
        workers = config.workers.count,
        max_requests = config.workers.max_requests,
        failure_policy = ?config.workers.failure_policy,
        "resident-server starting"
    );

    resident_server::serve(config, Arc::new(EchoKernelFactory)).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
