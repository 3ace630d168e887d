use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::admin::AdminState;
use crate::supervisor::table::PoolSnapshot;

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub ready: usize,
    pub expected: usize,
    pub uptime_secs: u64,
    pub requests_total: u64,
}

#[derive(Serialize)]
pub struct ReloadAccepted {
    pub status: &'static str,
}

fn status_label(snapshot: &PoolSnapshot) -> &'static str {
    if snapshot.shutting_down {
        "shutting_down"
    } else if snapshot.reloading {
        "reloading"
    } else if snapshot.ready < snapshot.expected {
        "degraded"
    } else {
        "operational"
    }
}

pub async fn get_status(State(state): State<AdminState>) -> Json<SystemStatus> {
    let snapshot = state.handle.snapshot();
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: status_label(&snapshot),
        ready: snapshot.ready,
        expected: snapshot.expected,
        uptime_secs: snapshot.uptime_secs,
        requests_total: snapshot.requests_total,
    })
}

pub async fn get_workers(State(state): State<AdminState>) -> Json<PoolSnapshot> {
    Json(state.handle.snapshot())
}

pub async fn post_reload(
    State(state): State<AdminState>,
) -> Result<(StatusCode, Json<ReloadAccepted>), StatusCode> {
    state.handle.reload().map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
    tracing::info!("Reload requested through admin API");
    Ok((
        StatusCode::ACCEPTED,
        Json(ReloadAccepted {
            status: "reload_requested",
        }),
    ))
}
