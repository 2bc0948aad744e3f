//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML, optional)
//!     → loader.rs (parse & deserialize)
//!     → RESIDENT_* environment overrides
//!     → validation.rs (semantic checks)
//!     → ServerConfig (validated, immutable)
//!     → shared via Arc with the supervisor and every worker
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; workers pick it up when they are (re)spawned
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, ConfigError};
pub use schema::{
    AppConfig, FailurePolicy, HandlerKind, LifecycleConfig, ListenerConfig, LogFormat,
    ObservabilityConfig, ServerConfig, SidecarConfig, WorkerConfig,
};
