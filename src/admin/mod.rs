//! Admin API: pool status and reload over HTTP, bearer-token protected.

pub mod auth;
pub mod handlers;

use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::config::schema::AdminConfig;
use crate::supervisor::SupervisorHandle;

use self::auth::admin_auth_middleware;
use self::handlers::*;

#[derive(Clone)]
pub struct AdminState {
    pub handle: SupervisorHandle,
    pub api_key: Arc<str>,
}

pub fn setup_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/workers", get(get_workers))
        .route("/admin/reload", post(post_reload))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the admin API until the pool starts shutting down.
pub async fn serve_admin(config: &AdminConfig, handle: SupervisorHandle) -> std::io::Result<()> {
    let listener = TcpListener::bind(&config.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Admin API listening");

    let router = setup_admin_router(AdminState {
        handle: handle.clone(),
        api_key: Arc::from(config.api_key.as_str()),
    });
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { handle.shutting_down().await })
        .await
}
