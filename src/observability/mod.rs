//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Supervisor and workers produce:
//!     → logging.rs (structured log events on stderr)
//!     → metrics.rs (supervisor-side counters and gauges)
//!
//! Consumers:
//!     → Log aggregation (stderr, pretty or JSON)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Structured logging (JSON) for machine parsing
//! - Request ID flows through worker log lines
//! - Metrics are cheap (atomic increments)

pub mod logging;
pub mod metrics;
