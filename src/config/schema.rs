//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the server.
//! All types derive Serde traits for deserialization from config files.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for the pre-forking server.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Listener configuration (bind address, backlog).
    pub listener: ListenerConfig,

    /// Worker pool sizing and per-worker behaviour.
    pub workers: WorkersConfig,

    /// Startup window and partial-startup policy.
    pub startup: StartupConfig,

    /// Graceful shutdown settings.
    pub shutdown: ShutdownConfig,

    /// Rolling reload settings.
    pub reload: ReloadConfig,

    /// Crash restart and crash-loop settings.
    pub restart: RestartConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Admin API settings.
    pub admin: AdminConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8001").
    pub bind_address: String,

    /// Kernel accept backlog for the shared socket.
    pub backlog: u32,

    /// Maximum concurrent connections per worker (backpressure).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8001".to_string(),
            backlog: 2048,
            max_connections: 1000,
        }
    }
}

/// How a worker invokes the application handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionModel {
    /// Blocking handler, run on a bounded thread pool inside the worker.
    Sync,
    /// Async handler, run cooperatively on the worker's event loop.
    #[default]
    AsyncEventLoop,
}

impl ExecutionModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionModel::Sync => "sync",
            ExecutionModel::AsyncEventLoop => "async_event_loop",
        }
    }
}

impl fmt::Display for ExecutionModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "sync" | "threaded" => Ok(ExecutionModel::Sync),
            "async" | "async_event_loop" | "event_loop" => Ok(ExecutionModel::AsyncEventLoop),
            other => Err(format!(
                "unknown worker class `{}` (expected `sync` or `async_event_loop`)",
                other
            )),
        }
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkersConfig {
    /// Number of worker processes kept alive.
    pub count: usize,

    /// Handler execution model inside each worker.
    pub execution_model: ExecutionModel,

    /// Blocking pool size per worker (sync execution model).
    pub threads: usize,

    /// Interval between worker heartbeats in milliseconds.
    pub heartbeat_interval_ms: u64,

    /// A ready worker silent for this long is killed and restarted.
    pub timeout_secs: u64,

    /// Idle keep-alive bound for client connections.
    pub keep_alive_secs: u64,

    /// Upper bound on a single handler invocation.
    pub request_timeout_secs: u64,

    /// Maximum request body size in bytes.
    pub max_body_bytes: usize,

    /// Recycle a worker after this many requests (0 disables).
    pub max_requests: u64,

    /// Random extra requests added to `max_requests` per worker.
    pub max_requests_jitter: u64,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            count: 4,
            execution_model: ExecutionModel::AsyncEventLoop,
            threads: 8,
            heartbeat_interval_ms: 1000,
            timeout_secs: 30,
            keep_alive_secs: 5,
            request_timeout_secs: 60,
            max_body_bytes: 2 * 1024 * 1024, // 2MB
            max_requests: 0,
            max_requests_jitter: 0,
        }
    }
}

impl WorkersConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// What to do when not every worker is ready at the end of the startup window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PartialStartupPolicy {
    /// Report the shortfall and keep serving with the workers that came up.
    #[default]
    Continue,
    /// Tear the pool down and fail startup.
    Fail,
}

/// Startup configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StartupConfig {
    /// How long `start` waits for every worker to report ready.
    pub timeout_secs: u64,

    /// Policy applied when the window closes with workers missing.
    pub on_partial: PartialStartupPolicy,
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            on_partial: PartialStartupPolicy::Continue,
        }
    }
}

impl StartupConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Shutdown configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Grace period for in-flight requests before workers are killed.
    pub graceful_timeout_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            graceful_timeout_secs: 30,
        }
    }
}

impl ShutdownConfig {
    pub fn graceful_timeout(&self) -> Duration {
        Duration::from_secs(self.graceful_timeout_secs)
    }
}

/// Rolling reload configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReloadConfig {
    /// Time a replaced worker gets to finish in-flight requests.
    pub drain_timeout_secs: u64,

    /// Files or directories whose changes trigger a rolling reload.
    pub watch_paths: Vec<String>,

    /// Quiet period used to coalesce bursts of file events.
    pub debounce_ms: u64,
}

impl Default for ReloadConfig {
    fn default() -> Self {
        Self {
            drain_timeout_secs: 30,
            watch_paths: Vec::new(),
            debounce_ms: 500,
        }
    }
}

impl ReloadConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

/// Crash restart configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RestartConfig {
    /// Rapid consecutive crashes tolerated before a slot is parked.
    pub max_consecutive_failures: u32,

    /// A worker exiting sooner than this after spawn counts as a rapid crash.
    pub min_uptime_secs: u64,

    /// Base delay for exponential restart backoff in milliseconds.
    pub base_delay_ms: u64,

    /// Maximum restart delay in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 5,
            min_uptime_secs: 10,
            base_delay_ms: 100,
            max_delay_ms: 5000,
        }
    }
}

impl RestartConfig {
    pub fn min_uptime(&self) -> Duration {
        Duration::from_secs(self.min_uptime_secs)
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable output for development.
    #[default]
    Pretty,
    /// One JSON object per line for log aggregation.
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Output format for log lines.
    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

/// Shipped `admin.api_key`; refused when the admin API is enabled.
pub const PLACEHOLDER_API_KEY: &str = "CHANGE_ME_IN_PRODUCTION";

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable admin API.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,

    /// Admin API bind address.
    pub bind_address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_key: PLACEHOLDER_API_KEY.to_string(),
            bind_address: "127.0.0.1:8081".to_string(),
        }
    }
}
