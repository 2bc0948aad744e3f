//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (worker count, request ceiling, limits)
//! - Check the handler chain composition
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServerConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::SocketAddr;

use crate::config::schema::ServerConfig;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("listener.bind_address `{0}` is not a socket address")]
    BindAddress(String),
    #[error("listener.max_connections must be greater than zero")]
    ZeroConnections,
    #[error("workers.count must be greater than zero")]
    ZeroWorkers,
    #[error("workers.max_requests must be greater than zero")]
    ZeroRequestCeiling,
    #[error("app.handlers must name at least one handler")]
    EmptyChain,
    #[error("app.handlers lists `{0}` more than once")]
    DuplicateHandler(String),
    #[error("observability.metrics_address `{0}` is not a socket address")]
    MetricsAddress(String),
    #[error("lifecycle.sidecar.command must name a program")]
    EmptySidecarCommand,
}

/// Check every semantic rule and collect all violations.
pub fn validate_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::BindAddress(
            config.listener.bind_address.clone(),
        ));
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::ZeroConnections);
    }
    if config.workers.count == 0 {
        errors.push(ValidationError::ZeroWorkers);
    }
    if config.workers.max_requests == 0 {
        errors.push(ValidationError::ZeroRequestCeiling);
    }
    if config.app.handlers.is_empty() {
        errors.push(ValidationError::EmptyChain);
    }

    let mut seen = HashSet::new();
    for kind in &config.app.handlers {
        if !seen.insert(*kind) {
            errors.push(ValidationError::DuplicateHandler(
                format!("{kind:?}").to_lowercase(),
            ));
        }
    }

    if config.observability.metrics_enabled
        && config
            .observability
            .metrics_address
            .parse::<SocketAddr>()
            .is_err()
    {
        errors.push(ValidationError::MetricsAddress(
            config.observability.metrics_address.clone(),
        ));
    }

    if let Some(sidecar) = &config.lifecycle.sidecar {
        if sidecar
            .command
            .first()
            .map_or(true, |program| program.trim().is_empty()) {
            errors.push(ValidationError::EmptySidecarCommand);
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
