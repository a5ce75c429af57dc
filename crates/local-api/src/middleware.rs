//! CSRF guard for the loopback API: mutating methods must carry a loopback
//! Host, and an Origin header (when present) must match the same origins.

use axum::{
    body::Body,
    extract::State,
    http::{Method, Request, StatusCode, header::ORIGIN},
    middleware::Next,
    response::Response,
};

use crate::state::AppState;

pub async fn csrf_guard(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    if matches!(
        *req.method(),
        Method::POST | Method::PUT | Method::DELETE
    ) {
        let port = state.ui_port;
        let host_ok = req
            .headers()
            .get(axum::http::header::HOST)
            .and_then(|value| value.to_str().ok())
            .map(|host| {
                host == format!("localhost:{}", port) || host == format!("127.0.0.1:{}", port)
            })
            .unwrap_or(false);
        if !host_ok {
            return Err(StatusCode::FORBIDDEN);
        }
        if let Some(origin) = req.headers().get(ORIGIN) {
            let origin_ok = origin
                .to_str()
                .map(|origin| {
                    origin == format!("http://localhost:{}", port)
                        || origin == format!("http://127.0.0.1:{}", port)
                })
                .unwrap_or(false);
            if !origin_ok {
                return Err(StatusCode::FORBIDDEN);
            }
        }
    }
    Ok(next.run(req).await)
}
