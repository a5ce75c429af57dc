use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::util::ServiceExt;

use crate::auth::Authenticator;
use crate::db::Db;
use crate::state::AppState;
use crate::router;

const SESSION_UUID: &str = "6b3f7f2e-4a89-4a5f-9f52-0a3f1e9a2b10";

struct TestServer {
    _dir: tempfile::TempDir,
    state: AppState,
}

fn setup() -> TestServer {
    setup_with_auth(Authenticator::off())
}

fn setup_with_auth(auth: Authenticator) -> TestServer {
    let dir = tempfile::tempdir().expect("temp dir");
    let db_path = dir.path().join("server.sqlite");
    let mut db = Db::open(&db_path).expect("open db");
    db.migrate().expect("migrate db");
    TestServer {
        _dir: dir,
        state: AppState::new(db_path, "https://tabs.example.com".to_string(), auth),
    }
}

fn issue_key(server: &TestServer, user: &str) -> String {
    let db = Db::open(&server.state.db_path).expect("open db");
    db.create_api_key(user, "test key").expect("create key").key
}

fn upload_body(session_id: &str) -> String {
    json!({
        "session": {
            "session_id": session_id,
            "tool": "claude-code",
            "events": [
                {
                    "event_type": "session_start",
                    "timestamp": "2026-01-01T12:00:00Z",
                    "tool": "claude-code",
                    "session_id": session_id,
                    "data": {"cwd": "/work/app"},
                },
                {
                    "event_type": "message",
                    "timestamp": "2026-01-01T12:00:05Z",
                    "data": {"role": "user", "content": [{"type": "text", "text": "fix the parser"}]},
                },
                {
                    "event_type": "message",
                    "timestamp": "2026-01-01T12:00:09Z",
                    "data": {"role": "assistant", "model": "claude-opus", "content": [{"type": "text", "text": "done"}]},
                },
                {
                    "event_type": "tool_use",
                    "timestamp": "2026-01-01T12:00:06Z",
                    "data": {"tool_use_id": "t1", "tool_name": "bash", "input": {"command": "cargo check"}},
                },
                {
                    "event_type": "tool_result",
                    "timestamp": "2026-01-01T12:00:08Z",
                    "data": {"tool_use_id": "t1", "content": "ok", "is_error": false},
                },
                {
                    "event_type": "session_end",
                    "timestamp": "2026-01-01T12:10:00Z",
                    "data": {"duration_seconds": 600},
                },
            ],
        },
        "tags": [
            {"key": "team", "value": "infra"},
            {"key": "team", "value": "infra"},
        ],
    })
    .to_string()
}

async fn send(server: &TestServer, request: Request<Body>) -> (StatusCode, Value) {
    let app = router(server.state.clone());
    let response = app.oneshot(request).await.expect("response");
    let status = response.status();
    let body = response
        .into_body()
        .collect()
        .await
        .expect("collect body")
        .to_bytes();
    let value = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).expect("parse body")
    };
    (status, value)
}

async fn upload(server: &TestServer, key: &str, body: String) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri("/api/sessions")
        .header("authorization", format!("Bearer {}", key))
        .header("content-type", "application/json")
        .body(Body::from(body))
        .expect("request");
    send(server, request).await
}

async fn get(server: &TestServer, uri: &str) -> (StatusCode, Value) {
    let request = Request::builder()
        .uri(uri)
        .body(Body::empty())
        .expect("request");
    send(server, request).await
}

#[tokio::test]
async fn upload_persists_and_duplicates_conflict() {
    let server = setup();
    let key = issue_key(&server, "dev@example.com");

    let (status, body) = upload(&server, &key, upload_body(SESSION_UUID)).await;
    assert_eq!(status, StatusCode::CREATED);
    let id = body["id"].as_str().expect("id").to_string();
    assert_eq!(
        body["url"],
        format!("https://tabs.example.com/sessions/{}", id)
    );

    let (status, body) = upload(&server, &key, upload_body(SESSION_UUID)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "duplicate_session");
}

#[tokio::test]
async fn upload_round_trip_matches_detail_view() {
    let server = setup();
    let key = issue_key(&server, "dev@example.com");
    let (_, created) = upload(&server, &key, upload_body(SESSION_UUID)).await;
    let id = created["id"].as_str().expect("id");

    let (status, body) = get(&server, &format!("/api/sessions/{}", id)).await;
    assert_eq!(status, StatusCode::OK);
    let session = &body["session"];
    assert_eq!(session["session_id"], SESSION_UUID);
    assert_eq!(session["tool"], "claude-code");
    assert_eq!(session["cwd"], "/work/app");
    assert_eq!(session["uploaded_by"], "dev@example.com");
    assert_eq!(session["message_count"], 2);
    assert_eq!(session["tool_use_count"], 1);
    assert_eq!(session["duration_seconds"], 600);

    let messages = session["messages"].as_array().expect("messages");
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["seq"], 1);
    assert_eq!(messages[0]["role"], "user");
    assert_eq!(messages[1]["seq"], 2);
    assert_eq!(messages[1]["model"], "claude-opus");

    let tools = session["tools"].as_array().expect("tools");
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0]["tool_name"], "bash");
    assert_eq!(tools[0]["output"]["content"], "ok");
    assert_eq!(tools[0]["is_error"], false);

    let tags = session["tags"].as_array().expect("tags");
    assert_eq!(tags.len(), 1);
    assert_eq!(tags[0]["key"], "team");
}

#[tokio::test]
async fn upload_auth_failures_are_401() {
    let server = setup();

    let request = Request::builder()
        .method("POST")
        .uri("/api/sessions")
        .header("content-type", "application/json")
        .body(Body::from(upload_body(SESSION_UUID)))
        .expect("request");
    let (status, body) = send(&server, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "invalid_api_key");

    let (status, _) = upload(&server, "sk-wrong-prefix", upload_body(SESSION_UUID)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = upload(
        &server,
        &format!("tabs_{}", "0".repeat(32)),
        upload_body(SESSION_UUID),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn revoked_and_expired_keys_are_rejected() {
    let server = setup();
    let key = issue_key(&server, "dev@example.com");

    {
        let db = Db::open(&server.state.db_path).expect("open db");
        db.conn
            .execute("UPDATE api_keys SET is_active = 0", [])
            .expect("revoke");
    }
    let (status, _) = upload(&server, &key, upload_body(SESSION_UUID)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let expired = issue_key(&server, "dev@example.com");
    {
        let db = Db::open(&server.state.db_path).expect("open db");
        db.conn
            .execute(
                "UPDATE api_keys SET is_active = 1, expires_at = '2000-01-01T00:00:00Z'",
                [],
            )
            .expect("expire");
    }
    let (status, body) = upload(&server, &expired, upload_body(SESSION_UUID)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "invalid_api_key");
}

#[tokio::test]
async fn upload_validation_errors_are_400() {
    let server = setup();
    let key = issue_key(&server, "dev@example.com");

    let (status, body) = upload(&server, &key, "{ not json".to_string()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "invalid_request");

    let no_cwd = json!({
        "session": {
            "session_id": SESSION_UUID,
            "tool": "claude-code",
            "events": [
                {"event_type": "message", "timestamp": "2026-01-01T12:00:00Z",
                 "data": {"role": "user", "content": []}},
            ],
        },
        "tags": [],
    })
    .to_string();
    let (status, body) = upload(&server, &key, no_cwd).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["message"], "missing session.cwd");
}

#[tokio::test]
async fn list_supports_filters_and_pagination() {
    let server = setup();
    let key = issue_key(&server, "dev@example.com");
    let (status, _) = upload(&server, &key, upload_body(SESSION_UUID)).await;
    assert_eq!(status, StatusCode::CREATED);

    let second = "9d1a6a30-21f5-4f4e-8a6f-35f0c2d7e901";
    let body = upload_body(second).replace("claude-code", "cursor");
    let (status, _) = upload(&server, &key, body).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = get(&server, "/api/sessions").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 2);
    assert_eq!(body["pagination"]["page"], 1);
    assert_eq!(body["pagination"]["limit"], 20);
    assert_eq!(body["pagination"]["total_pages"], 1);
    let sessions = body["sessions"].as_array().expect("sessions");
    assert_eq!(sessions.len(), 2);
    assert_eq!(sessions[0]["summary"], "fix the parser");

    let (_, body) = get(&server, "/api/sessions?tool=cursor").await;
    assert_eq!(body["total"], 1);
    assert_eq!(body["sessions"][0]["session_id"], second);

    let (_, body) = get(&server, "/api/sessions?tag=team:infra").await;
    assert_eq!(body["total"], 2);
    let (_, body) = get(&server, "/api/sessions?tag=team:nobody").await;
    assert_eq!(body["total"], 0);

    let (_, body) = get(&server, "/api/sessions?q=parser").await;
    assert_eq!(body["total"], 2);
    let (_, body) = get(&server, "/api/sessions?q=cargo+check").await;
    assert_eq!(body["total"], 2);
    let (_, body) = get(&server, "/api/sessions?q=no-such-text").await;
    assert_eq!(body["total"], 0);

    let (_, body) = get(&server, "/api/sessions?uploaded_by=dev@example.com").await;
    assert_eq!(body["total"], 2);
    let (_, body) = get(&server, "/api/sessions?uploaded_by=other@example.com").await;
    assert_eq!(body["total"], 0);

    let (_, body) = get(&server, "/api/sessions?limit=1&page=2").await;
    assert_eq!(body["total"], 2);
    assert_eq!(body["sessions"].as_array().expect("sessions").len(), 1);
    assert_eq!(body["pagination"]["total_pages"], 2);
}

#[tokio::test]
async fn detail_validates_uuid_and_missing_sessions() {
    let server = setup();

    let (status, body) = get(&server, "/api/sessions/not-a-uuid").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "invalid_request");

    let (status, body) = get(&server, &format!("/api/sessions/{}", SESSION_UUID)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "session_not_found");
}

#[tokio::test]
async fn tags_endpoint_returns_histogram() {
    let server = setup();
    let key = issue_key(&server, "dev@example.com");
    upload(&server, &key, upload_body(SESSION_UUID)).await;

    let (status, body) = get(&server, "/api/tags").await;
    assert_eq!(status, StatusCode::OK);
    let tags = body["tags"].as_array().expect("tags");
    assert_eq!(tags.len(), 1);
    assert_eq!(tags[0]["key"], "team");
    assert_eq!(tags[0]["value"], "infra");
    assert_eq!(tags[0]["count"], 1);

    let (_, body) = get(&server, "/api/tags?key=missing").await;
    assert_eq!(body["tags"].as_array().expect("tags").len(), 0);
}

#[tokio::test]
async fn key_lifecycle_create_list_revoke() {
    let server = setup();
    let app_body = json!({"name": "ci uploads"}).to_string();
    let request = Request::builder()
        .method("POST")
        .uri("/api/keys")
        .header("content-type", "application/json")
        .body(Body::from(app_body))
        .expect("request");
    let (status, created) = send(&server, request).await;
    assert_eq!(status, StatusCode::CREATED);
    let plaintext = created["key"].as_str().expect("key");
    assert!(plaintext.starts_with("tabs_"));
    assert_eq!(created["key_prefix"].as_str().expect("prefix").len(), 13);
    let key_id = created["id"].as_str().expect("id").to_string();

    // The plaintext never comes back from the list.
    let (status, body) = get(&server, "/api/keys").await;
    assert_eq!(status, StatusCode::OK);
    let keys = body["keys"].as_array().expect("keys");
    assert_eq!(keys.len(), 1);
    assert!(keys[0].get("key").is_none());
    assert_eq!(keys[0]["is_active"], true);

    let request = Request::builder()
        .method("DELETE")
        .uri(format!("/api/keys/{}", key_id))
        .body(Body::empty())
        .expect("request");
    let (status, _) = send(&server, request).await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = get(&server, "/api/keys").await;
    assert_eq!(body["keys"][0]["is_active"], false);

    // Revoking again still matches the row (idempotent update), but an
    // unknown id is 404.
    let request = Request::builder()
        .method("DELETE")
        .uri(format!("/api/keys/{}", SESSION_UUID))
        .body(Body::empty())
        .expect("request");
    let (status, body) = send(&server, request).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "not_found");
}

#[tokio::test]
async fn key_usage_is_tracked_on_upload() {
    let server = setup();
    // Auth is off, so the reader identity is the empty user; the key must
    // belong to it for the list below to see the usage counters.
    let key = issue_key(&server, "");
    upload(&server, &key, upload_body(SESSION_UUID)).await;

    let (_, body) = get(&server, "/api/keys").await;
    assert_eq!(body["keys"][0]["usage_count"], 1);
    assert!(body["keys"][0]["last_used_at"].is_string());
}

#[tokio::test]
async fn header_auth_guards_reads_but_not_ingestion() {
    let server = setup_with_auth(Authenticator::header("X-User"));

    let (status, body) = get(&server, "/api/sessions").await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "forbidden");

    let request = Request::builder()
        .uri("/api/sessions")
        .header("X-User", "dev@example.com")
        .body(Body::empty())
        .expect("request");
    let (status, _) = send(&server, request).await;
    assert_eq!(status, StatusCode::OK);

    // Ingestion still authenticates with the API key alone.
    let key = issue_key(&server, "dev@example.com");
    let (status, _) = upload(&server, &key, upload_body(SESSION_UUID)).await;
    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test]
async fn healthz_pings_the_database() {
    let server = setup();
    let (status, _) = get(&server, "/healthz").await;
    assert_eq!(status, StatusCode::OK);
}
