//! Network layer: the thin runtime underneath the request lifecycle.
//!
//! # Data Flow
//! ```text
//! Supervisor binds once (listener.rs::bind_shared)
//!     → each worker registers its own duplicate (WorkerListener::register)
//!     → accept loop, connection slots bounded by semaphore
//!     → connection.rs counts the connection for drain/status
//!     → wire.rs frames requests (httparse) and writes emissions
//!     → multipart.rs spools uploaded files for the decoder
//! ```

pub mod connection;
pub mod listener;
pub mod multipart;
pub mod wire;

pub use connection::{ConnectionId, ConnectionSlot, ConnectionTracker};
pub use listener::{bind_shared, Accepted, ListenerError, WorkerListener};
pub use wire::{read_request, write_emission, ConnectionInfo, RawRequest, WireError, WireLimits};
