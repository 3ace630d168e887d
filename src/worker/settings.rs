//! Per-worker settings handed down by the supervisor.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::schema::{ExecutionModel, LogFormat, ServerConfig};
use crate::http::HttpSettings;

/// Environment variable carrying the JSON-encoded [`WorkerSettings`].
pub const WORKER_SETTINGS_ENV: &str = "PREFORK_WORKER_SETTINGS";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("{env} is not set; workers are started by the supervisor", env = WORKER_SETTINGS_ENV)]
    Missing,

    #[error("malformed {env}: {0}", env = WORKER_SETTINGS_ENV)]
    Malformed(#[from] serde_json::Error),
}

/// The projection of [`ServerConfig`] one worker needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSettings {
    pub worker_id: u64,
    pub slot: usize,
    pub execution_model: ExecutionModel,
    pub threads: usize,
    pub heartbeat_interval_ms: u64,
    pub keep_alive_ms: u64,
    pub request_timeout_ms: u64,
    pub drain_timeout_ms: u64,
    pub max_body_bytes: usize,
    pub max_connections: usize,
    /// Already jittered by the supervisor; 0 disables recycling.
    pub max_requests: u64,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl WorkerSettings {
    pub fn from_config(config: &ServerConfig, worker_id: u64, slot: usize, max_requests: u64) -> Self {
        // The worker's own drain bound covers both reload and shutdown; the
        // supervisor enforces whichever deadline actually applies.
        let drain_timeout = config
            .reload
            .drain_timeout()
            .max(config.shutdown.graceful_timeout());

        Self {
            worker_id,
            slot,
            execution_model: config.workers.execution_model,
            threads: config.workers.threads,
            heartbeat_interval_ms: config.workers.heartbeat_interval_ms,
            keep_alive_ms: config.workers.keep_alive().as_millis() as u64,
            request_timeout_ms: config.workers.request_timeout().as_millis() as u64,
            drain_timeout_ms: drain_timeout.as_millis() as u64,
            max_body_bytes: config.workers.max_body_bytes,
            max_connections: config.listener.max_connections,
            max_requests,
            log_level: config.observability.log_level.clone(),
            log_format: config.observability.log_format,
        }
    }

    /// Read the settings from the environment.
    pub fn from_env() -> Result<Self, SettingsError> {
        let raw = std::env::var(WORKER_SETTINGS_ENV).map_err(|_| SettingsError::Missing)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn to_env_value(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn http_settings(&self) -> HttpSettings {
        HttpSettings {
            keep_alive: Duration::from_millis(self.keep_alive_ms),
            max_body_bytes: self.max_body_bytes,
            drain_timeout: Duration::from_millis(self.drain_timeout_ms),
            max_requests: self.max_requests,
        }
    }
}
