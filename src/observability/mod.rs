//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Workers and the supervisor produce:
//!     → logging.rs (structured log events, one span per request)
//!     → metrics.rs (counters, histograms)
//!
//! Consumers:
//!     → Log aggregation (stdout, pretty or JSON)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Structured logging with request ids on every request span
//! - Metrics are cheap (no-ops until a recorder is installed)

pub mod logging;
pub mod metrics;
