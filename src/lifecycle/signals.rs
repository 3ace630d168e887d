//! OS signal handling.
//!
//! # Responsibilities
//! - Register signal handlers (SIGTERM, SIGINT, SIGHUP, SIGQUIT)
//! - Translate signals to supervisor commands or a worker drain
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - A second SIGTERM/SIGINT at the supervisor forces shutdown
//! - SIGHUP triggers a rolling reload, not shutdown

use tokio::signal::unix::{signal, Signal, SignalKind};

use crate::lifecycle::shutdown::{DrainReason, Shutdown};
use crate::supervisor::{ShutdownMode, SupervisorHandle};

/// Drain this worker on SIGTERM or SIGINT.
///
/// Repeat signals are absorbed; the first one already started the drain and
/// the supervisor escalates with SIGKILL if the deadline passes.
pub async fn forward_worker_signals(shutdown: Shutdown) {
    let (mut term, mut int) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
        (Ok(term), Ok(int)) => (term, int),
        (Err(e), _) | (_, Err(e)) => {
            tracing::error!(error = %e, "Failed to install worker signal handlers");
            return;
        }
    };

    loop {
        tokio::select! {
            Some(()) = term.recv() => {}
            Some(()) = int.recv() => {}
            else => return,
        }
        if shutdown.trigger(DrainReason::Signal) {
            tracing::info!("Received termination signal");
        }
    }
}

/// Supervisor signal streams.
///
/// Installed before the pool starts so a signal during startup is queued
/// rather than killing the supervisor.
pub struct SupervisorSignals {
    term: Signal,
    int: Signal,
    hup: Signal,
    quit: Signal,
}

impl SupervisorSignals {
    pub fn install() -> std::io::Result<Self> {
        Ok(Self {
            term: signal(SignalKind::terminate())?,
            int: signal(SignalKind::interrupt())?,
            hup: signal(SignalKind::hangup())?,
            quit: signal(SignalKind::quit())?,
        })
    }

    /// Map signals onto control commands. Returns once the supervisor has gone away.
    pub async fn forward(mut self, handle: SupervisorHandle) {
        loop {
            let sent = tokio::select! {
                Some(()) = self.term.recv() => {
                    tracing::info!(signal = "SIGTERM", "Graceful shutdown requested");
                    handle.shutdown(ShutdownMode::Graceful)
                }
                Some(()) = self.int.recv() => {
                    tracing::info!(signal = "SIGINT", "Graceful shutdown requested");
                    handle.shutdown(ShutdownMode::Graceful)
                }
                Some(()) = self.quit.recv() => {
                    tracing::warn!(signal = "SIGQUIT", "Immediate shutdown requested");
                    handle.shutdown(ShutdownMode::Immediate)
                }
                Some(()) = self.hup.recv() => {
                    tracing::info!(signal = "SIGHUP", "Reload requested");
                    handle.reload()
                }
                else => return,
            };

            if sent.is_err() {
                return;
            }
        }
    }
}
