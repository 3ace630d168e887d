//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Supervisor:
//!     listener.rs ListeningEndpoint::bind (once per lifetime)
//!     → descriptor inherited by every worker across exec
//!
//! Worker:
//!     inherit_listener → Listener (accept loop, connection limits)
//!     → connection.rs (lifecycle tracking, request counters)
//!     → Hand off to HTTP layer
//! ```
//!
//! # Design Decisions
//! - Bounded accept prevents resource exhaustion in one worker
//! - Each connection tracked for graceful drain

pub mod connection;
pub mod listener;

pub use listener::{inherit_listener, BindError, Listener, ListeningEndpoint, LISTEN_FD_ENV};
