//! Startup orchestration results.
//!
//! # Responsibilities
//! - Summarize how the pool came up within the startup window
//!
//! # Design Decisions
//! - Fail fast: config and bind errors are fatal before any worker runs
//! - Listener binds before workers spawn (workers inherit it)
//! - A short pool is reported, then handled by `startup.on_partial`

use std::time::Duration;

use serde::Serialize;

/// Outcome of the startup window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StartupReport {
    pub expected: usize,
    pub ready: usize,
    #[serde(rename = "elapsed_ms", serialize_with = "as_millis")]
    pub elapsed: Duration,
}

impl StartupReport {
    pub fn is_complete(&self) -> bool {
        self.ready >= self.expected
    }

    pub fn missing(&self) -> usize {
        self.expected.saturating_sub(self.ready)
    }
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_pool_is_incomplete() {
        let report = StartupReport {
            expected: 4,
            ready: 3,
            elapsed: Duration::from_millis(1500),
        };
        assert!(!report.is_complete());
        assert_eq!(report.missing(), 1);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["elapsed_ms"], 1500);
    }
}
