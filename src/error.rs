//! Top-level error taxonomy.

use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;
use crate::net::BindError;
use crate::supervisor::spawn::ExitReason;
use crate::supervisor::table::WorkerId;

/// Errors surfaced by the server.
///
/// `WorkerCrash` and `CrashLoop` are logged by the supervisor rather than
/// returned; the pool keeps running around them.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Bind(#[from] BindError),

    #[error("only {ready} of {expected} workers became ready within {timeout:?}")]
    PartialStartup {
        ready: usize,
        expected: usize,
        timeout: Duration,
    },

    #[error("{worker} in slot {slot} {reason}")]
    WorkerCrash {
        slot: usize,
        worker: WorkerId,
        reason: ExitReason,
    },

    #[error("slot {slot} crashed {failures} times in a row; not restarting until reload")]
    CrashLoop { slot: usize, failures: u32 },

    #[error("failed to spawn worker: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    /// Process exit code for a fatal error.
    pub fn exit_code(&self) -> i32 {
        match self {
            ServerError::Config(_) => 2,
            ServerError::Bind(_) => 3,
            ServerError::PartialStartup { .. } => 4,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ValidationError;

    #[test]
    fn exit_codes() {
        let config = ServerError::from(ConfigError::Validation(vec![ValidationError::NoWorkers]));
        assert_eq!(config.exit_code(), 2);

        let bind = ServerError::from(BindError {
            address: "0.0.0.0:80".into(),
            source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
        });
        assert_eq!(bind.exit_code(), 3);
        assert!(bind.to_string().contains("0.0.0.0:80"));

        assert_eq!(ServerError::Io(std::io::Error::other("x")).exit_code(), 1);
    }

    #[test]
    fn crash_message_names_worker() {
        let err = ServerError::WorkerCrash {
            slot: 2,
            worker: WorkerId(7),
            reason: ExitReason::Exited(101),
        };
        assert_eq!(err.to_string(), "worker-7 in slot 2 exited with status 101");
    }
}
