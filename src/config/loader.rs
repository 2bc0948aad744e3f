//! Configuration loading from disk and environment.

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::schema::ServerConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Overrides the worker count.
pub const ENV_WORKER_COUNT: &str = "RESIDENT_WORKER_COUNT";
/// Overrides the per-worker request ceiling.
pub const ENV_MAX_REQUESTS: &str = "RESIDENT_MAX_REQUESTS";
/// Overrides the bind address.
pub const ENV_BIND_ADDRESS: &str = "RESIDENT_BIND_ADDRESS";
/// Overrides the project directory.
pub const ENV_PROJECT_DIR: &str = "RESIDENT_PROJECT_DIR";

/// Error type for configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Validation(Vec<ValidationError>),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Validation(errors) => {
                write!(f, "Validation failed: ")?;
                for (i, err) in errors.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", err)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Load, override from the environment, and validate configuration.
///
/// A missing `path` means "defaults only".
pub fn load_config(path: Option<&Path>) -> Result<ServerConfig, ConfigError> {
    let mut config = match path {
        Some(path) => {
            let content = fs::read_to_string(path).map_err(ConfigError::Io)?;
            toml::from_str(&content).map_err(ConfigError::Parse)?
        }
        None => ServerConfig::default(),
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());

    validate_config(&config).map_err(ConfigError::Validation)?;

    Ok(config)
}

/// Apply the `RESIDENT_*` overrides. Unparseable numbers are ignored with a warning.
pub fn apply_env_overrides<F>(config: &mut ServerConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(ENV_WORKER_COUNT) {
        match raw.trim().parse() {
            Ok(count) => config.workers.count = count,
            Err(_) => tracing::warn!(value = %raw, "Ignoring non-numeric {}", ENV_WORKER_COUNT),
        }
    }
    if let Some(raw) = lookup(ENV_MAX_REQUESTS) {
        match raw.trim().parse() {
            Ok(max) => config.workers.max_requests = max,
            Err(_) => tracing::warn!(value = %raw, "Ignoring non-numeric {}", ENV_MAX_REQUESTS),
        }
    }
    if let Some(addr) = lookup(ENV_BIND_ADDRESS) {
        config.listener.bind_address = addr;
    }
    if let Some(dir) = lookup(ENV_PROJECT_DIR) {
        config.app.project_dir = PathBuf::from(dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn env_overrides_win_over_file_values() {
        let env: HashMap<&str, &str> = [
            (ENV_WORKER_COUNT, "7"),
            (ENV_MAX_REQUESTS, "250"),
            (ENV_BIND_ADDRESS, "0.0.0.0:9000"),
        ]
        .into_iter()
        .collect();

        let mut config = ServerConfig::default();
        apply_env_overrides(&mut config, |key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.workers.count, 7);
        assert_eq!(config.workers.max_requests, 250);
        assert_eq!(config.listener.bind_address, "0.0.0.0:9000");
    }

    #[test]
    fn garbage_override_is_ignored() {
        let mut config = ServerConfig::default();
        let before = config.workers.count;
        apply_env_overrides(&mut config, |key| {
            (key == ENV_WORKER_COUNT).then(|| "many".to_string())
        });
        assert_eq!(config.workers.count, before);
    }

    #[test]
    fn invalid_file_reports_validation_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[workers]\ncount = 0").unwrap();

        match load_config(Some(file.path())) {
            Err(ConfigError::Validation(errors)) => {
                assert!(errors.contains(&ValidationError::ZeroWorkers))
            }
            other => panic!("expected validation failure, got {other:?}"),
        }
    }

    #[test]
    fn unparseable_file_is_a_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[workers").unwrap();
        assert!(matches!(
            load_config(Some(file.path())),
            Err(ConfigError::Parse(_))
        ));
    }
}
