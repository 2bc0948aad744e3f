//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! RawRequest (net/wire.rs)
//!     → decode.rs (normalize: headers, cookies, query, form, uploads)
//!     → server.rs (orchestrator: static fast path, handler chain)
//!     → encode.rs (status line, canonical headers, keep-alive decision)
//!     → Emission → net/wire.rs (write to the connection)
//! ```

pub mod decode;
pub mod encode;
pub mod headers;
pub mod request;
pub mod response;
pub mod server;

pub use decode::decode;
pub use encode::{encode, ConnectionAction, Emission, EmissionBody};
pub use headers::Headers;
pub use request::{FileTree, NormalizedRequest, Params, RequestId, UploadError, UploadedFile};
pub use response::{Body, NormalizedResponse};
pub use server::{DispatchError, MessageOutcome, Orchestrator, StopReason};
