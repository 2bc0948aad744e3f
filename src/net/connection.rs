//! Per-worker connection bookkeeping.
//!
//! # Responsibilities
//! - Number a worker's connections for log correlation
//! - Count open connections (status snapshot, graceful drain)
//! - Let a stopping worker wait, with a deadline, for its connections to end
//!
//! # Design Decisions
//! - The open count is an atomic shared with the supervisor, which reads it
//!   from another thread; everything else stays on the worker
//! - Draining waits on a `Notify` fired when the last slot is released

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

/// Identifier of one accepted connection, unique within its worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    worker: usize,
    seq: u64,
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "w{}-c{}", self.worker, self.seq)
    }
}

/// Open connections of one worker.
#[derive(Debug, Clone)]
pub struct ConnectionTracker {
    worker: usize,
    next_seq: Arc<AtomicU64>,
    open: Arc<AtomicU64>,
    closed: Arc<Notify>,
}

impl ConnectionTracker {
    /// `open` is the counter the supervisor reads for this worker.
    pub fn new(worker: usize, open: Arc<AtomicU64>) -> Self {
        Self {
            worker,
            next_seq: Arc::new(AtomicU64::new(1)),
            open,
            closed: Arc::new(Notify::new()),
        }
    }

    /// Register a newly accepted connection. It counts as open until the
    /// returned slot is dropped.
    pub fn open(&self) -> ConnectionSlot {
        self.open.fetch_add(1, Ordering::SeqCst);
        let id = ConnectionId {
            worker: self.worker,
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
        };
        tracing::trace!(connection_id = %id, "Connection opened");
        ConnectionSlot {
            id,
            open: Arc::clone(&self.open),
            closed: Arc::clone(&self.closed),
        }
    }

    pub fn open_count(&self) -> u64 {
        self.open.load(Ordering::SeqCst)
    }

    /// Wait until every connection is closed or `deadline` passes.
    /// Returns true when the worker drained completely.
    pub async fn drain(&self, deadline: Duration) -> bool {
        let idle = async {
            loop {
                let notified = self.closed.notified();
                if self.open_count() == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(deadline, idle).await.is_ok()
    }
}

/// One open connection. Dropping it closes the slot.
#[derive(Debug)]
pub struct ConnectionSlot {
    id: ConnectionId,
    open: Arc<AtomicU64>,
    closed: Arc<Notify>,
}

impl ConnectionSlot {
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        if self.open.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.closed.notify_waiters();
        }
        tracing::trace!(connection_id = %self.id, "Connection closed");
    }
}
