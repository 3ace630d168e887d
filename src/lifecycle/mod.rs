//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Load config → Validate → Bind listener → Spawn workers → Report
//!
//! Shutdown (shutdown.rs):
//!     Drain trigger → Stop accepting → Finish in-flight requests → Exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Graceful shutdown (supervisor) or drain (worker)
//!     SIGQUIT → Immediate shutdown
//!     SIGHUP → Rolling reload
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then listener, then workers
//! - Ordered shutdown: stop accept, drain, close
//! - Shutdown has timeout: forced kill after deadline

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::{DrainReason, DrainSignal, Shutdown};
pub use startup::StartupReport;
