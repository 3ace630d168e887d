//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (worker count > 0, timeouts within bounds)
//! - Validate address shapes (`host:port` with a numeric port)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServerConfig → Result<(), Vec<ValidationError>>
//! - Runs before any socket is bound or worker spawned

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::config::schema::{ExecutionModel, ServerConfig, PLACEHOLDER_API_KEY};

/// Upper bound on any configured timeout or delay.
pub const MAX_DURATION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("workers.count must be at least 1")]
    NoWorkers,

    #[error("workers.threads must be at least 1 for the sync execution model")]
    NoThreads,

    #[error("listener.max_connections must be at least 1")]
    NoConnections,

    #[error("{field} `{value}` is not a valid host:port address")]
    InvalidAddress { field: &'static str, value: String },

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    #[error("{0} must not exceed one week")]
    DurationTooLong(&'static str),

    #[error("workers.heartbeat_interval_ms must be shorter than workers.timeout_secs")]
    HeartbeatTooSlow,

    #[error("restart.max_delay_ms must not be below restart.base_delay_ms")]
    BackoffRange,

    #[error("admin.api_key must be set to a non-placeholder value when the admin API is enabled")]
    AdminKeyUnset,
}

/// Validate a configuration, collecting every problem found.
pub fn validate_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.workers.count == 0 {
        errors.push(ValidationError::NoWorkers);
    }
    if config.workers.execution_model == ExecutionModel::Sync && config.workers.threads == 0 {
        errors.push(ValidationError::NoThreads);
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::NoConnections);
    }

    check_address(&mut errors, "listener.bind_address", &config.listener.bind_address);
    if config.admin.enabled {
        check_address(&mut errors, "admin.bind_address", &config.admin.bind_address);
        let key = config.admin.api_key.trim();
        if key.is_empty() || key == PLACEHOLDER_API_KEY {
            errors.push(ValidationError::AdminKeyUnset);
        }
    }
    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::InvalidAddress {
            field: "observability.metrics_address",
            value: config.observability.metrics_address.clone(),
        });
    }

    let durations = [
        ("workers.heartbeat_interval_ms", Duration::from_millis(config.workers.heartbeat_interval_ms)),
        ("workers.timeout_secs", Duration::from_secs(config.workers.timeout_secs)),
        ("workers.request_timeout_secs", Duration::from_secs(config.workers.request_timeout_secs)),
        ("startup.timeout_secs", Duration::from_secs(config.startup.timeout_secs)),
        ("shutdown.graceful_timeout_secs", Duration::from_secs(config.shutdown.graceful_timeout_secs)),
        ("reload.drain_timeout_secs", Duration::from_secs(config.reload.drain_timeout_secs)),
    ];
    for (field, value) in durations {
        if value.is_zero() {
            errors.push(ValidationError::ZeroDuration(field));
        } else if value > MAX_DURATION {
            errors.push(ValidationError::DurationTooLong(field));
        }
    }
    if Duration::from_millis(config.restart.max_delay_ms) > MAX_DURATION {
        errors.push(ValidationError::DurationTooLong("restart.max_delay_ms"));
    }

    // A heartbeat interval at or above the hung-worker timeout kills every worker.
    if config.workers.heartbeat_interval_ms > 0
        && config.workers.timeout_secs > 0
        && config.workers.heartbeat_interval_ms >= config.workers.timeout_secs.saturating_mul(1000)
    {
        errors.push(ValidationError::HeartbeatTooSlow);
    }

    if config.restart.max_delay_ms < config.restart.base_delay_ms {
        errors.push(ValidationError::BackoffRange);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Split `host:port`, accepting bracketed IPv6 hosts.
pub fn split_host_port(address: &str) -> Option<(&str, u16)> {
    let (host, port) = address.rsplit_once(':')?;
    let port = port.parse::<u16>().ok()?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() || host.contains(char::is_whitespace) {
        return None;
    }
    Some((host, port))
}

fn check_address(errors: &mut Vec<ValidationError>, field: &'static str, value: &str) {
    if split_host_port(value).is_none() {
        errors.push(ValidationError::InvalidAddress {
            field,
            value: value.to_string(),
        });
    }
}
