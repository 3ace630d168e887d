//! Restart policy: exponential backoff with jitter and crash-loop detection.

use std::time::Duration;

use rand::Rng;
use serde::Serialize;

use crate::config::schema::RestartConfig;

/// Per-slot restart bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RestartTracker {
    /// Rapid exits in a row (reset by a worker that outlived `min_uptime`).
    pub consecutive_failures: u32,
    /// Restarts performed for this slot since start.
    pub restarts: u64,
}

impl RestartTracker {
    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
    }
}

/// What to do after a slot's worker exited unexpectedly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Spawn a replacement after `delay`.
    Restart { delay: Duration },
    /// Stop restarting; the slot is crash-looping.
    GiveUp { failures: u32 },
}

/// Restart policy shared by every slot.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    max_consecutive_failures: u32,
    min_uptime: Duration,
    base_delay_ms: u64,
    max_delay_ms: u64,
}

impl RestartPolicy {
    pub fn from_config(config: &RestartConfig) -> Self {
        Self {
            max_consecutive_failures: config.max_consecutive_failures,
            min_uptime: config.min_uptime(),
            base_delay_ms: config.base_delay_ms,
            max_delay_ms: config.max_delay_ms,
        }
    }

    /// Decide on a restart. `uptime` is `None` when the worker never started.
    pub fn on_exit(&self, tracker: &mut RestartTracker, uptime: Option<Duration>) -> RestartDecision {
        let rapid = uptime.map_or(true, |up| up < self.min_uptime);
        if rapid {
            tracker.consecutive_failures += 1;
        } else {
            tracker.consecutive_failures = 0;
        }

        if tracker.consecutive_failures > self.max_consecutive_failures {
            return RestartDecision::GiveUp {
                failures: tracker.consecutive_failures,
            };
        }

        tracker.restarts += 1;
        RestartDecision::Restart {
            delay: self.backoff(tracker.consecutive_failures),
        }
    }

    /// Exponential backoff delay with jitter.
    ///
    /// Attempt 0 (a worker that ran long enough) restarts immediately.
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponential_base = 2u64.saturating_pow(attempt - 1);
        let delay_ms = self.base_delay_ms.saturating_mul(exponential_base);
        let capped_delay = delay_ms.min(self.max_delay_ms);

        // Apply jitter (0 to 10% of the delay)
        let jitter_range = capped_delay / 10;
        let jitter = if jitter_range > 0 {
            rand::thread_rng().gen_range(0..jitter_range)
        } else {
            0
        };

        Duration::from_millis(capped_delay + jitter)
    }
}

/// Pick this worker's request quota: `base` plus up to `jitter` extra.
pub fn jittered_max_requests(base: u64, jitter: u64) -> u64 {
    if base == 0 {
        return 0;
    }
    if jitter == 0 {
        return base;
    }
    base + rand::thread_rng().gen_range(0..=jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_failures: u32) -> RestartPolicy {
        RestartPolicy::from_config(&RestartConfig {
            max_consecutive_failures: max_failures,
            min_uptime_secs: 10,
            base_delay_ms: 100,
            max_delay_ms: 1000,
        })
    }

    #[test]
    fn test_backoff_calculation() {
        let p = policy(5);
        assert_eq!(p.backoff(0), Duration::ZERO);

        let b1 = p.backoff(1);
        assert!(b1.as_millis() >= 100 && b1.as_millis() < 110);

        let b2 = p.backoff(2);
        assert!(b2.as_millis() >= 200);

        let max = p.backoff(10);
        assert!(max.as_millis() >= 1000 && max.as_millis() < 1100);
    }

    #[test]
    fn rapid_failures_give_up_after_threshold() {
        let p = policy(3);
        let mut tracker = RestartTracker::default();
        let quick = Some(Duration::from_millis(50));

        for _ in 0..3 {
            assert!(matches!(p.on_exit(&mut tracker, quick), RestartDecision::Restart { .. }));
        }
        assert_eq!(p.on_exit(&mut tracker, quick), RestartDecision::GiveUp { failures: 4 });
        assert_eq!(tracker.restarts, 3);
    }

    #[test]
    fn never_started_counts_as_rapid() {
        let p = policy(0);
        let mut tracker = RestartTracker::default();
        assert_eq!(p.on_exit(&mut tracker, None), RestartDecision::GiveUp { failures: 1 });
    }

    #[test]
    fn long_lived_worker_resets_counter() {
        let p = policy(3);
        let mut tracker = RestartTracker::default();
        p.on_exit(&mut tracker, Some(Duration::from_millis(1)));
        p.on_exit(&mut tracker, Some(Duration::from_millis(1)));
        assert_eq!(tracker.consecutive_failures, 2);

        let decision = p.on_exit(&mut tracker, Some(Duration::from_secs(60)));
        assert_eq!(decision, RestartDecision::Restart { delay: Duration::ZERO });
        assert_eq!(tracker.consecutive_failures, 0);
    }

    #[test]
    fn max_requests_jitter_stays_in_range() {
        assert_eq!(jittered_max_requests(0, 50), 0);
        assert_eq!(jittered_max_requests(100, 0), 100);
        for _ in 0..100 {
            let n = jittered_max_requests(100, 10);
            assert!((100..=110).contains(&n));
        }
    }
}
