use axum::{
    Json,
    extract::{Path, Query, State},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::warn;

use tabs_core::Tag;

use crate::errors::HttpError;
use crate::ipc::{DaemonClient, IpcError};
use crate::sessions::{self, SessionFilter};
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct SessionsQuery {
    #[serde(default)]
    tool: String,
    #[serde(default)]
    date: String,
    #[serde(default)]
    cwd: String,
    #[serde(default)]
    q: String,
}

pub async fn list_sessions(
    State(state): State<AppState>,
    Query(query): Query<SessionsQuery>,
) -> Result<Json<Value>, HttpError> {
    let filter = SessionFilter {
        tool: query.tool,
        date: query.date,
        cwd: query.cwd,
        q: query.q,
    };
    let sessions = sessions::list_sessions(&state.base_dir, &filter).map_err(|err| {
        warn!(error = %err, "session list failed");
        HttpError::server_error("Failed to load sessions")
    })?;
    let total = sessions.len();
    Ok(Json(json!({ "sessions": sessions, "total": total })))
}

pub async fn session_detail(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, HttpError> {
    if session_id.is_empty() {
        return Err(HttpError::bad_request("invalid_request", "Missing session id"));
    }
    let detail = sessions::get_session(&state.base_dir, &session_id)
        .map_err(|err| {
            warn!(error = %err, "session detail failed");
            HttpError::server_error("Failed to load session")
        })?
        .ok_or_else(|| HttpError::not_found("session_not_found", "Session not found"))?;
    Ok(Json(json!({ "session": detail })))
}

pub async fn get_config(State(state): State<AppState>) -> Result<Json<Value>, HttpError> {
    let cfg = tabs_config::load_or_default(&state.config_path)
        .map_err(|_| HttpError::server_error("Failed to load config"))?;

    let api_key_configured = !cfg.remote.api_key.is_empty();
    let mut api_key_prefix = cfg.remote.api_key.clone();
    api_key_prefix.truncate(12);

    Ok(Json(json!({
        "local": {
            "ui_port": cfg.local.ui_port,
            "log_level": cfg.local.log_level,
        },
        "remote": {
            "server_url": cfg.remote.server_url,
            "api_key_configured": api_key_configured,
            "api_key_prefix": api_key_prefix,
            "default_tags": cfg.remote.default_tags,
        },
    })))
}

#[derive(Debug, Default, Deserialize)]
pub struct ConfigUpdate {
    #[serde(default)]
    remote: RemoteUpdate,
}

#[derive(Debug, Default, Deserialize)]
pub struct RemoteUpdate {
    server_url: Option<String>,
    api_key: Option<String>,
}

pub async fn put_config(
    State(state): State<AppState>,
    Json(payload): Json<ConfigUpdate>,
) -> Result<Json<Value>, HttpError> {
    let mut cfg = tabs_config::load_or_default(&state.config_path)
        .map_err(|_| HttpError::server_error("Failed to load config"))?;

    if let Some(server_url) = payload.remote.server_url {
        tabs_config::apply_set(&mut cfg, "server_url", &server_url)
            .map_err(|err| HttpError::bad_request("invalid_request", err.to_string()))?;
    }
    if let Some(api_key) = payload.remote.api_key {
        tabs_config::apply_set(&mut cfg, "api_key", &api_key)
            .map_err(|err| HttpError::bad_request("invalid_request", err.to_string()))?;
    }

    tabs_config::write(&state.config_path, &cfg)
        .map_err(|_| HttpError::server_error("Failed to update config"))?;

    Ok(Json(json!({
        "status": "ok",
        "message": "Configuration updated",
    })))
}

pub async fn daemon_status(State(state): State<AppState>) -> Json<Value> {
    let client = DaemonClient::new(&state.base_dir);
    match client.daemon_status().await {
        Ok(status) => Json(json!({
            "running": true,
            "pid": status.pid,
            "uptime_seconds": status.uptime_seconds,
            "sessions_captured": status.sessions_captured,
            "events_processed": status.events_processed,
        })),
        Err(_) => Json(json!({ "running": false })),
    }
}

#[derive(Debug, Deserialize)]
pub struct PushRequest {
    #[serde(default)]
    session_id: String,
    #[serde(default)]
    tool: String,
    #[serde(default)]
    tags: Vec<Tag>,
}

pub async fn push_session(
    State(state): State<AppState>,
    Json(payload): Json<PushRequest>,
) -> Result<Json<Value>, HttpError> {
    if payload.session_id.trim().is_empty() || payload.tool.trim().is_empty() {
        return Err(HttpError::bad_request(
            "invalid_request",
            "session_id and tool are required",
        ));
    }

    let client = DaemonClient::new(&state.base_dir);
    let request = json!({
        "session_id": payload.session_id,
        "tool": payload.tool,
        "tags": payload.tags,
    });
    match client.push_session(request).await {
        Ok(data) => Ok(Json(json!({
            "status": "ok",
            "remote_id": data.get("remote_id").cloned().unwrap_or(Value::Null),
            "url": data.get("url").cloned().unwrap_or(Value::Null),
        }))),
        Err(IpcError::Daemon { code, message }) => {
            Err(HttpError::bad_request(&code, message))
        }
        Err(err) => {
            warn!(error = %err, "push proxy failed");
            Err(HttpError::server_error("Failed to push session"))
        }
    }
}
