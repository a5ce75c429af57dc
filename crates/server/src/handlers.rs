use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::warn;
use uuid::Uuid;

use crate::browse::{DEFAULT_PAGE_LIMIT, MAX_PAGE_LIMIT, normalize_tag_filter};
use crate::db::Db;
use crate::errors::{ApiError, Result};
use crate::ingest::{normalize_upload, parse_bearer_token};
use crate::state::AppState;
use crate::types::{Pagination, SessionFilter, UploadRequest};

fn open_db(state: &AppState) -> Result<Db> {
    Db::open(&state.db_path)
}

pub async fn upload_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse> {
    let authorization = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    let api_key = parse_bearer_token(authorization)?;

    let mut db = open_db(&state)?;
    let key_record = db.lookup_api_key(api_key)?;

    let request: UploadRequest = serde_json::from_slice(&body)
        .map_err(|_| ApiError::InvalidRequest("Invalid JSON body".to_string()))?;
    let normalized = normalize_upload(request)?;

    if db.session_exists(&normalized.tool, &normalized.session_id)? {
        return Err(ApiError::DuplicateSession);
    }
    let remote_id = db.store_session(&normalized, &key_record)?;

    let url = format!(
        "{}/sessions/{}",
        state.base_url.trim_end_matches('/'),
        remote_id
    );
    Ok((
        StatusCode::CREATED,
        Json(json!({ "id": remote_id, "url": url })),
    ))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    tool: String,
    #[serde(default)]
    uploaded_by: String,
    #[serde(default)]
    q: String,
    #[serde(default)]
    tag: Vec<String>,
    page: Option<i64>,
    limit: Option<i64>,
    #[serde(default)]
    sort: String,
    #[serde(default)]
    order: String,
}

pub async fn list_sessions(
    State(state): State<AppState>,
    headers: HeaderMap,
    RawListQuery(query): RawListQuery,
) -> Result<Json<Value>> {
    state.auth.authenticate(&headers)?;

    let mut filter = SessionFilter {
        tool: query.tool,
        uploaded_by: query.uploaded_by,
        query: query.q,
        tags: Vec::new(),
        page: query.page.unwrap_or(1),
        limit: query.limit.unwrap_or(DEFAULT_PAGE_LIMIT).min(MAX_PAGE_LIMIT),
        sort: query.sort,
        order: query.order,
    };
    for raw in &query.tag {
        if let Some(tag) = normalize_tag_filter(raw) {
            filter.tags.push(tag);
        }
    }

    let db = open_db(&state)?;
    let (sessions, total) = db.list_sessions(&filter).map_err(|err| {
        warn!(error = %err, "session list failed");
        ApiError::Internal("Failed to load sessions".to_string())
    })?;

    let limit = if filter.limit > 0 {
        filter.limit
    } else {
        DEFAULT_PAGE_LIMIT
    };
    let total_pages = if total == 0 { 0 } else { (total + limit - 1) / limit };
    Ok(Json(json!({
        "sessions": sessions,
        "total": total,
        "pagination": Pagination {
            page: filter.page.max(1),
            limit,
            total_pages,
        },
    })))
}

/// `tag` repeats in the query string; serde_urlencoded cannot collect
/// repeated keys, so the list query is parsed by hand.
pub struct RawListQuery(pub ListQuery);

#[axum::async_trait]
impl<S: Send + Sync> axum::extract::FromRequestParts<S> for RawListQuery {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        _state: &S,
    ) -> Result<Self> {
        let mut query = ListQuery::default();
        let raw = parts.uri.query().unwrap_or_default();
        for (key, value) in form_urlencoded::parse(raw.as_bytes()) {
            match key.as_ref() {
                "tool" => query.tool = value.to_string(),
                "uploaded_by" => query.uploaded_by = value.to_string(),
                "q" => query.q = value.to_string(),
                "tag" => query.tag.push(value.to_string()),
                "page" => query.page = value.parse().ok(),
                "limit" => query.limit = value.parse().ok(),
                "sort" => query.sort = value.to_string(),
                "order" => query.order = value.to_string(),
                _ => {}
            }
        }
        Ok(RawListQuery(query))
    }
}

pub async fn session_detail(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    state.auth.authenticate(&headers)?;
    if Uuid::parse_str(&id).is_err() {
        return Err(ApiError::InvalidRequest("Invalid session id".to_string()));
    }
    let db = open_db(&state)?;
    let session = db.get_session(&id)?;
    Ok(Json(json!({ "session": session })))
}

#[derive(Debug, Default, Deserialize)]
pub struct TagsQuery {
    #[serde(default)]
    key: String,
    limit: Option<i64>,
}

pub async fn list_tags(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<TagsQuery>,
) -> Result<Json<Value>> {
    state.auth.authenticate(&headers)?;
    let limit = query.limit.unwrap_or(100).clamp(1, 200);
    let db = open_db(&state)?;
    let tags = db.list_tags(&query.key, limit)?;
    Ok(Json(json!({ "tags": tags })))
}

pub async fn list_keys(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    let user_id = state.auth.authenticate(&headers)?;
    let db = open_db(&state)?;
    let keys = db.list_api_keys(&user_id)?;
    Ok(Json(json!({ "keys": keys })))
}

#[derive(Debug, Deserialize)]
pub struct CreateKeyRequest {
    #[serde(default)]
    name: String,
}

pub async fn create_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse> {
    let user_id = state.auth.authenticate(&headers)?;
    let payload: CreateKeyRequest = serde_json::from_slice(&body)
        .map_err(|_| ApiError::InvalidRequest("Invalid JSON body".to_string()))?;
    let name = payload.name.trim();
    if name.is_empty() {
        return Err(ApiError::InvalidRequest("Name is required".to_string()));
    }

    let db = open_db(&state)?;
    let created = db.create_api_key(&user_id, name)?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "id": created.id,
            "key": created.key,
            "key_prefix": created.key_prefix,
            "name": name,
            "created_at": created.created_at,
        })),
    ))
}

pub async fn revoke_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    let user_id = state.auth.authenticate(&headers)?;
    if Uuid::parse_str(&id).is_err() {
        return Err(ApiError::InvalidRequest("Invalid key id".to_string()));
    }
    let db = open_db(&state)?;
    db.revoke_api_key(&id, &user_id)?;
    Ok(Json(json!({
        "status": "ok",
        "message": "API key revoked",
    })))
}

pub async fn healthz(State(state): State<AppState>) -> StatusCode {
    match open_db(&state).and_then(|db| db.ping()) {
        Ok(()) => StatusCode::OK,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}
