//! Loopback HTTP API over the local session store: list/detail views for
//! the UI, config read/update, and proxies to the daemon socket for status
//! and push.

mod errors;
mod handlers;
mod middleware;
pub mod ipc;
pub mod sessions;
mod state;

use axum::{
    Router,
    middleware as axum_middleware,
    routing::{get, post},
};

pub use state::AppState;

pub fn router(state: AppState) -> Router<()> {
    Router::new()
        .route("/api/sessions", get(handlers::list_sessions))
        .route("/api/sessions/push", post(handlers::push_session))
        .route("/api/sessions/:session_id", get(handlers::session_detail))
        .route(
            "/api/config",
            get(handlers::get_config).put(handlers::put_config),
        )
        .route("/api/daemon/status", get(handlers::daemon_status))
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::csrf_guard,
        ))
        .with_state(state)
}
