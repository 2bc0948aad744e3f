//! The listening socket, bound once and shared by every worker.
//!
//! # Responsibilities
//! - Bind the configured address in the supervisor, before any worker exists
//! - Register a duplicate of the socket with each worker's own runtime
//! - Bound each worker's concurrent connections with a semaphore
//!
//! # Design Decisions
//! - Workers compete for connections on the same socket; the kernel hands
//!   each connection to whichever worker accepts first
//! - A worker at its connection limit stops accepting; the backlog (and the
//!   other workers) absorb the load

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::wire::ConnectionInfo;
use crate::config::ListenerConfig;

#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("invalid bind address {0:?}")]
    Address(String),
    #[error("failed to bind {address}")]
    Bind {
        address: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to register listener with worker runtime")]
    Register(#[source] std::io::Error),
    #[error("failed to accept connection")]
    Accept(#[source] std::io::Error),
}

/// Bind the socket every worker will accept from.
pub fn bind_shared(config: &ListenerConfig) -> Result<std::net::TcpListener, ListenerError> {
    let address: SocketAddr = config
        .bind_address
        .parse()
        .map_err(|_| ListenerError::Address(config.bind_address.clone()))?;
    let bind_error = |source| ListenerError::Bind { address, source };

    let listener = std::net::TcpListener::bind(address).map_err(bind_error)?;
    listener.set_nonblocking(true).map_err(bind_error)?;

    tracing::info!(address = %listener.local_addr().map_err(bind_error)?, "Listener bound");
    Ok(listener)
}

/// A connection handed to a worker, with the slot it occupies.
#[derive(Debug)]
pub struct Accepted {
    pub stream: TcpStream,
    pub info: ConnectionInfo,
    pub permit: OwnedSemaphorePermit,
}

/// One worker's bounded view of the shared socket.
pub struct WorkerListener {
    inner: TcpListener,
    slots: Arc<Semaphore>,
}

impl WorkerListener {
    /// Register a duplicate of `shared` with the current runtime.
    ///
    /// Must be called from inside the worker's runtime.
    pub fn register(
        shared: &std::net::TcpListener,
        max_connections: usize,
    ) -> Result<Self, ListenerError> {
        let duplicate = shared.try_clone().map_err(ListenerError::Register)?;
        duplicate.set_nonblocking(true).map_err(ListenerError::Register)?;
        Ok(Self {
            inner: TcpListener::from_std(duplicate).map_err(ListenerError::Register)?,
            slots: Arc::new(Semaphore::new(max_connections)),
        })
    }

    /// Wait for a free slot, then for a connection.
    pub async fn accept(&self) -> Result<Accepted, ListenerError> {
        let permit = Arc::clone(&self.slots).acquire_owned().await.map_err(|_| {
            ListenerError::Accept(std::io::Error::other("connection slots closed"))
        })?;

        let (stream, remote) = self.inner.accept().await.map_err(ListenerError::Accept)?;
        let info = ConnectionInfo {
            remote: Some(remote),
            local: stream.local_addr().ok(),
        };
        tracing::debug!(
            peer_addr = %remote,
            free_slots = self.slots.available_permits(),
            "Connection accepted"
        );
        Ok(Accepted {
            stream,
            info,
            permit,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    pub fn free_slots(&self) -> usize {
        self.slots.available_permits()
    }
}
