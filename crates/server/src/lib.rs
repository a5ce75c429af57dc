//! The remote tabs server: validates, deduplicates, and persists uploaded
//! sessions into a relational schema, and serves authenticated queries
//! over the result.

pub mod auth;
pub mod browse;
pub mod db;
mod errors;
mod handlers;
pub mod ingest;
pub mod keys;
mod state;
pub mod types;

use axum::{
    Router,
    routing::{delete, get},
};

pub use db::Db;
pub use errors::ApiError;
pub use state::AppState;

pub fn router(state: AppState) -> Router<()> {
    Router::new()
        .route(
            "/api/sessions",
            get(handlers::list_sessions).post(handlers::upload_session),
        )
        .route("/api/sessions/:id", get(handlers::session_detail))
        .route("/api/tags", get(handlers::list_tags))
        .route(
            "/api/keys",
            get(handlers::list_keys).post(handlers::create_key),
        )
        .route("/api/keys/:id", delete(handlers::revoke_key))
        .route("/healthz", get(handlers::healthz))
        .with_state(state)
}

#[cfg(test)]
mod tests;
