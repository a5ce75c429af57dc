//! Upload pipeline tests against a scripted HTTP stub.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use tabs_daemon::push::{PushPayload, push_session};
use tabs_daemon::paths;

/// Minimal scripted HTTP server: each connection is answered with the next
/// `(status, body)` pair; requests are drained up to the blank line plus
/// declared body length.
async fn spawn_stub(responses: Vec<(u16, String)>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind stub");
    let addr = listener.local_addr().expect("addr");
    let counter = Arc::new(AtomicUsize::new(0));

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let index = counter.fetch_add(1, Ordering::SeqCst);
            let (status, body) = responses
                .get(index)
                .cloned()
                .unwrap_or((500, String::new()));

            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            let (mut header_end, mut content_length) = (None, 0usize);
            loop {
                let Ok(n) = stream.read(&mut chunk).await else {
                    break;
                };
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
                if header_end.is_none() {
                    if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                        header_end = Some(pos + 4);
                        let headers = String::from_utf8_lossy(&buf[..pos]);
                        for line in headers.lines() {
                            if let Some(value) = line
                                .to_ascii_lowercase()
                                .strip_prefix("content-length:")
                                .map(str::trim)
                                .and_then(|v| v.parse().ok())
                            {
                                content_length = value;
                            }
                        }
                    }
                }
                if let Some(end) = header_end {
                    if buf.len() >= end + content_length {
                        break;
                    }
                }
            }

            let reason = match status {
                201 => "Created",
                400 => "Bad Request",
                401 => "Unauthorized",
                409 => "Conflict",
                _ => "Internal Server Error",
            };
            let response = format!(
                "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                reason,
                body.len(),
                body
            );
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        }
    });

    format!("http://{}", addr)
}

fn setup_session(base: &Path) {
    paths::ensure_layout(base).expect("layout");
    let day = paths::sessions_dir(base).join("2026-01-01");
    fs::create_dir_all(&day).expect("day dir");
    let lines = [
        r#"{"event_type":"session_start","timestamp":"2026-01-01T12:00:00Z","tool":"claude-code","session_id":"S1","data":{"cwd":"/work"}}"#,
        r#"{"event_type":"message","timestamp":"2026-01-01T12:00:05Z","tool":"claude-code","session_id":"S1","data":{"role":"user","content":[{"type":"text","text":"hi"}]}}"#,
    ];
    fs::write(
        day.join("S1-claude-code-1767268800.jsonl"),
        format!("{}\n", lines.join("\n")),
    )
    .expect("session file");
}

fn write_config(base: &Path, server_url: &str) -> std::path::PathBuf {
    let mut cfg = tabs_config::Config::default();
    cfg.remote.server_url = server_url.to_string();
    cfg.remote.api_key = format!("tabs_{}", "a".repeat(32));
    cfg.remote.default_tags = vec!["team:infra".to_string()];
    let path = base.join("config.toml");
    tabs_config::write(&path, &cfg).expect("write config");
    path
}

fn payload() -> PushPayload {
    serde_json::from_value(json!({
        "session_id": "S1",
        "tool": "claude-code",
        "tags": [{"key": "run", "value": "ci"}],
    }))
    .expect("payload")
}

#[tokio::test]
async fn push_success_then_duplicate() {
    let dir = tempfile::tempdir().expect("temp dir");
    setup_session(dir.path());
    let server_url = spawn_stub(vec![
        (
            201,
            json!({"id": "R1", "url": "https://tabs.example.com/sessions/R1"}).to_string(),
        ),
        (
            409,
            json!({"error": {"code": "duplicate_session", "message": "Session already uploaded"}})
                .to_string(),
        ),
    ])
    .await;
    let config_path = write_config(dir.path(), &server_url);

    let result = push_session(dir.path(), &config_path, payload())
        .await
        .expect("first push");
    assert_eq!(result.remote_id, "R1");
    assert_eq!(result.url, "https://tabs.example.com/sessions/R1");

    let err = push_session(dir.path(), &config_path, payload())
        .await
        .expect_err("second push");
    assert_eq!(err.code, "duplicate_session");
}

#[tokio::test]
async fn unauthorized_maps_to_invalid_api_key() {
    let dir = tempfile::tempdir().expect("temp dir");
    setup_session(dir.path());
    let server_url = spawn_stub(vec![(401, String::new())]).await;
    let config_path = write_config(dir.path(), &server_url);

    let err = push_session(dir.path(), &config_path, payload())
        .await
        .expect_err("push");
    assert_eq!(err.code, "invalid_api_key");
}

#[tokio::test]
async fn remote_error_body_is_forwarded() {
    let dir = tempfile::tempdir().expect("temp dir");
    setup_session(dir.path());
    let server_url = spawn_stub(vec![(
        400,
        json!({"error": {"code": "invalid_request", "message": "missing session.cwd"}}).to_string(),
    )])
    .await;
    let config_path = write_config(dir.path(), &server_url);

    let err = push_session(dir.path(), &config_path, payload())
        .await
        .expect_err("push");
    assert_eq!(err.code, "invalid_request");
    assert_eq!(err.message, "missing session.cwd");
}

#[tokio::test]
async fn opaque_remote_failure_is_network_error() {
    let dir = tempfile::tempdir().expect("temp dir");
    setup_session(dir.path());
    let server_url = spawn_stub(vec![(500, "oops".to_string())]).await;
    let config_path = write_config(dir.path(), &server_url);

    let err = push_session(dir.path(), &config_path, payload())
        .await
        .expect_err("push");
    assert_eq!(err.code, "network_error");
}

#[tokio::test]
async fn push_without_config_fails_before_network() {
    let dir = tempfile::tempdir().expect("temp dir");
    setup_session(dir.path());

    // No config at all: server_url is empty.
    let missing = dir.path().join("missing.toml");
    let err = push_session(dir.path(), &missing, payload())
        .await
        .expect_err("push");
    assert_eq!(err.code, "invalid_request");

    // URL but no key.
    let mut cfg = tabs_config::Config::default();
    cfg.remote.server_url = "https://tabs.example.com".to_string();
    let path = dir.path().join("config.toml");
    tabs_config::write(&path, &cfg).expect("write config");
    let err = push_session(dir.path(), &path, payload())
        .await
        .expect_err("push");
    assert_eq!(err.code, "no_api_key");
}

#[tokio::test]
async fn unknown_session_is_not_found() {
    let dir = tempfile::tempdir().expect("temp dir");
    paths::ensure_layout(dir.path()).expect("layout");
    let config_path = write_config(dir.path(), "https://tabs.example.com");

    let err = push_session(dir.path(), &config_path, payload())
        .await
        .expect_err("push");
    assert_eq!(err.code, "session_not_found");
}

#[tokio::test]
async fn invalid_tool_is_rejected() {
    let dir = tempfile::tempdir().expect("temp dir");
    let config_path = write_config(dir.path(), "https://tabs.example.com");
    let bad: PushPayload = serde_json::from_value(json!({
        "session_id": "S1",
        "tool": "emacs",
    }))
    .expect("payload");
    let err = push_session(dir.path(), &config_path, bad)
        .await
        .expect_err("push");
    assert_eq!(err.code, "invalid_payload");
}
