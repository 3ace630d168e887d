//! File watcher that triggers rolling reloads.
//!
//! Watches `reload.watch_paths` and asks the supervisor for a rolling reload
//! once a burst of change events has settled for `reload.debounce_ms`.

use std::path::PathBuf;
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::supervisor::SupervisorHandle;

/// A watcher that monitors application files for changes.
pub struct ReloadWatcher {
    paths: Vec<PathBuf>,
    debounce: Duration,
}

impl ReloadWatcher {
    /// Create a new ReloadWatcher.
    pub fn new(paths: Vec<PathBuf>, debounce: Duration) -> Self {
        Self { paths, debounce }
    }

    /// Start watching in the background.
    ///
    /// The returned watcher must be kept alive for events to flow.
    pub fn run(self, handle: SupervisorHandle) -> Result<RecommendedWatcher, notify::Error> {
        let (tx, rx) = mpsc::unbounded_channel::<()>();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if event.kind.is_modify() || event.kind.is_create() || event.kind.is_remove() {
                        tracing::debug!(paths = ?event.paths, "Watched file changed");
                        let _ = tx.send(());
                    }
                }
                Err(e) => tracing::error!(error = %e, "Watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        for path in &self.paths {
            watcher.watch(path, RecursiveMode::Recursive)?;
        }

        tracing::info!(paths = ?self.paths, "Reload watcher started");
        tokio::spawn(debounce_loop(rx, self.debounce, handle));

        Ok(watcher)
    }
}

async fn debounce_loop(
    mut rx: mpsc::UnboundedReceiver<()>,
    debounce: Duration,
    handle: SupervisorHandle,
) {
    while rx.recv().await.is_some() {
        // Swallow the rest of the burst.
        loop {
            match tokio::time::timeout(debounce, rx.recv()).await {
                Ok(Some(())) => continue,
                Ok(None) => return,
                Err(_) => break,
            }
        }

        tracing::info!("File change detected, starting rolling reload");
        if handle.reload().is_err() {
            tracing::debug!("Supervisor gone, stopping reload watcher");
            return;
        }
    }
}
