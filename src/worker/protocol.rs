//! Status protocol from worker to supervisor.
//!
//! Messages are JSON-serialized and newline-delimited, written to the
//! worker's stdout. Logs go to stderr so they never mix with status lines.

use serde::{Deserialize, Serialize};

use crate::lifecycle::shutdown::DrainReason;

/// Status message from worker to supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// The worker is accepting connections.
    Ready,

    /// Periodic liveness report.
    Heartbeat {
        /// Requests currently inside the handler
        in_flight: u64,
        /// Requests taken since the worker started
        requests: u64,
    },

    /// The worker stopped accepting and is finishing in-flight requests.
    Draining { reason: DrainReason },

    /// Last message before a clean exit.
    Exiting { requests: u64 },
}

impl WorkerMessage {
    /// Serialize to JSON line (with newline).
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Deserialize from JSON line.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}
