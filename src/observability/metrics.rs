//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define pool metrics (worker states, spawns, crashes, reloads)
//! - Expose Prometheus-compatible metrics endpoint
//!
//! # Metrics
//! - `prefork_workers` (gauge): workers by `state`
//! - `prefork_workers_expected` (gauge): configured pool size
//! - `prefork_worker_spawns_total` (counter)
//! - `prefork_worker_exits_total` (counter): by `kind` (crash, retired)
//! - `prefork_crash_loops_total` (counter)
//! - `prefork_reloads_total` (counter)
//! - `prefork_requests_total` (gauge): requests served by all workers, from heartbeats
//!
//! # Design Decisions
//! - Only the supervisor records metrics; workers report through heartbeats
//! - Recording is a no-op until the exporter is installed

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

use crate::supervisor::table::PoolSnapshot;

/// Install the Prometheus exporter and its HTTP listener.
///
/// Must be called from within a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_worker_spawned() {
    metrics::counter!("prefork_worker_spawns_total").increment(1);
}

/// `crash` for unexpected exits, `retired` for drained ones.
pub fn record_worker_exit(crashed: bool) {
    let kind = if crashed { "crash" } else { "retired" };
    metrics::counter!("prefork_worker_exits_total", "kind" => kind).increment(1);
}

pub fn record_crash_loop() {
    metrics::counter!("prefork_crash_loops_total").increment(1);
}

pub fn record_reload() {
    metrics::counter!("prefork_reloads_total").increment(1);
}

pub fn record_reload_aborted() {
    metrics::counter!("prefork_reloads_aborted_total").increment(1);
}

/// Publish pool gauges from a snapshot.
pub fn record_pool(snapshot: &PoolSnapshot) {
    metrics::gauge!("prefork_workers_expected").set(snapshot.expected as f64);
    metrics::gauge!("prefork_workers", "state" => "ready").set(snapshot.ready as f64);
    metrics::gauge!("prefork_workers", "state" => "starting").set(snapshot.starting as f64);
    metrics::gauge!("prefork_workers", "state" => "draining").set(snapshot.draining as f64);
    metrics::gauge!("prefork_requests_total").set(snapshot.requests_total as f64);
}
