//! Resident multi-worker HTTP server for a long-lived application kernel.

pub mod config;
pub mod handler;
pub mod http;
pub mod kernel;
pub mod lifecycle;
pub mod net;
pub mod observability;

pub use config::ServerConfig;
pub use kernel::{Kernel, KernelError, KernelFactory, KernelRequest, KernelResponse, RequestContext, Resettable};
pub use lifecycle::{serve, Shutdown, Supervisor};
