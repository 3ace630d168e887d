//! Configuration loading from disk, environment and CLI overrides.
//!
//! Precedence, highest first: CLI flags, environment variables (clap reads
//! both into [`ConfigOverrides`]), the TOML file, built-in defaults.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::config::schema::{ExecutionModel, ServerConfig};
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Values supplied on the command line or through `PREFORK_*` variables.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub workers: Option<usize>,
    pub bind: Option<String>,
    pub execution_model: Option<ExecutionModel>,
    pub threads: Option<usize>,
    pub graceful_timeout_secs: Option<u64>,
    pub log_level: Option<String>,
}

impl ConfigOverrides {
    /// Layer the overrides on top of a parsed configuration.
    pub fn apply(&self, config: &mut ServerConfig) {
        if let Some(count) = self.workers {
            config.workers.count = count;
        }
        if let Some(bind) = &self.bind {
            config.listener.bind_address = bind.clone();
        }
        if let Some(model) = self.execution_model {
            config.workers.execution_model = model;
        }
        if let Some(threads) = self.threads {
            config.workers.threads = threads;
        }
        if let Some(secs) = self.graceful_timeout_secs {
            config.shutdown.graceful_timeout_secs = secs;
        }
        if let Some(level) = &self.log_level {
            config.observability.log_level = level.clone();
        }
    }
}

/// Parse a configuration from TOML text without validating it.
pub fn parse_config(content: &str) -> Result<ServerConfig, ConfigError> {
    Ok(toml::from_str(content)?)
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<ServerConfig, ConfigError> {
    load(Some(path), &ConfigOverrides::default())
}

/// Build the effective configuration: optional file, then overrides, then validation.
pub fn load(path: Option<&Path>, overrides: &ConfigOverrides) -> Result<ServerConfig, ConfigError> {
    let mut config = match path {
        Some(path) => {
            let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            parse_config(&content)?
        }
        None => ServerConfig::default(),
    };

    overrides.apply(&mut config);
    validate_config(&config).map_err(ConfigError::Validation)?;

    Ok(config)
}
