//! Drain coordination inside a worker.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Why a worker stopped accepting new connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainReason {
    /// SIGTERM/SIGINT, usually from the supervisor (reload or shutdown).
    Signal,
    /// The worker served its request quota.
    MaxRequests,
    /// The status channel to the supervisor broke.
    Orphaned,
}

impl fmt::Display for DrainReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DrainReason::Signal => "signal",
            DrainReason::MaxRequests => "max_requests",
            DrainReason::Orphaned => "orphaned",
        };
        f.write_str(s)
    }
}

/// Coordinator for graceful drain.
///
/// Backed by a watch channel so tasks that subscribe after the trigger still
/// observe it. The first trigger wins; later reasons are ignored.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<Option<DrainReason>>>,
}

impl Shutdown {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Subscribe to the drain signal.
    pub fn subscribe(&self) -> DrainSignal {
        DrainSignal {
            rx: self.tx.subscribe(),
        }
    }

    /// Trigger the drain. Returns true if this call was the first trigger.
    pub fn trigger(&self, reason: DrainReason) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                false
            } else {
                *current = Some(reason);
                true
            }
        })
    }

    /// The reason of the first trigger, if any.
    pub fn reason(&self) -> Option<DrainReason> {
        *self.tx.borrow()
    }

    pub fn is_triggered(&self) -> bool {
        self.reason().is_some()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving half of [`Shutdown`].
#[derive(Debug, Clone)]
pub struct DrainSignal {
    rx: watch::Receiver<Option<DrainReason>>,
}

impl DrainSignal {
    /// Resolve once a drain has been triggered.
    ///
    /// Pends forever if the coordinator is dropped without triggering.
    pub async fn wait(&mut self) -> DrainReason {
        let reason = match self.rx.wait_for(Option::is_some).await {
            Ok(reason) => *reason,
            Err(_) => None,
        };
        match reason {
            Some(reason) => reason,
            None => std::future::pending().await,
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.rx.borrow().is_some()
    }
}
