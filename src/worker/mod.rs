//! Worker process subsystem.
//!
//! # Data Flow
//! ```text
//! supervisor spawns `<exe> worker`
//!     → settings.rs (PREFORK_WORKER_SETTINGS)
//!     → net::inherit_listener (PREFORK_LISTEN_FD)
//!     → process.rs (HTTP server + status reporting)
//!     → protocol.rs lines on stdout: ready, heartbeat, draining, exiting
//! ```
//!
//! # Design Decisions
//! - A worker never binds; it only accepts on the inherited socket
//! - SIGTERM means drain, never abort
//! - Losing the supervisor (broken stdout) also means drain

pub mod process;
pub mod protocol;
pub mod settings;

use thiserror::Error;

pub use process::{run_worker, run_worker_process};
pub use protocol::WorkerMessage;
pub use settings::{SettingsError, WorkerSettings, WORKER_SETTINGS_ENV};

use crate::net::listener::ListenerError;

/// Errors that end a worker process.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error("worker I/O error: {0}")]
    Io(#[from] std::io::Error),
}
