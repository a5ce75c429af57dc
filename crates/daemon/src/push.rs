//! Upload pipeline: derive a canonical session document from the local log
//! and post it to the remote server under the configured API key.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use tabs_core::{
    EVENT_SESSION_END, EVENT_SESSION_START, Tag, format_rfc3339, is_supported_tool, merge_tags,
    parse_rfc3339,
};
use tabs_config::Config;

use crate::state::find_existing_session_file;

const UPLOAD_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
pub struct PushPayload {
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub tool: String,
    #[serde(default)]
    pub tags: Vec<Tag>,
}

#[derive(Debug, Default)]
pub struct PushResult {
    pub remote_id: String,
    pub url: String,
}

/// Push failures carry the wire error code alongside the human message.
#[derive(Debug)]
pub struct PushError {
    pub code: String,
    pub message: String,
}

impl PushError {
    fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for PushError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for PushError {}

#[derive(Debug, Serialize)]
struct UploadRequest {
    session: UploadSession,
    tags: Vec<Tag>,
}

#[derive(Debug, Serialize)]
struct UploadSession {
    session_id: String,
    tool: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    created_at: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    ended_at: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    cwd: String,
    events: Vec<UploadEvent>,
}

/// The canonical event subset shipped to the remote; extra local fields are
/// dropped on re-encode.
#[derive(Debug, Serialize, Deserialize)]
pub struct UploadEvent {
    #[serde(default)]
    pub event_type: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub tool: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Default)]
pub struct SessionMeta {
    pub created_at: String,
    pub ended_at: String,
    pub cwd: String,
}

pub async fn push_session(
    base_dir: &Path,
    config_path: &Path,
    payload: PushPayload,
) -> Result<PushResult, PushError> {
    if payload.session_id.is_empty() || payload.tool.is_empty() {
        return Err(PushError::new(
            "invalid_payload",
            "session_id and tool are required",
        ));
    }
    if !is_supported_tool(&payload.tool) {
        return Err(PushError::new(
            "invalid_payload",
            "tool must be claude-code or cursor",
        ));
    }

    let cfg = tabs_config::load_or_default(config_path)
        .map_err(|_| PushError::new("storage_error", "failed to read config"))?;
    if cfg.remote.server_url.trim().is_empty() {
        return Err(PushError::new("invalid_request", "server_url not configured"));
    }
    if cfg.remote.api_key.trim().is_empty() {
        return Err(PushError::new("no_api_key", "API key not configured"));
    }

    let path = find_existing_session_file(base_dir, &payload.session_id, &payload.tool)
        .map_err(|_| PushError::new("storage_error", "failed to locate session file"))?;
    let Some(path) = path else {
        return Err(PushError::new("session_not_found", "session not found"));
    };

    let (events, meta) = read_session_events(&path)
        .map_err(|err| PushError::new("storage_error", err.to_string()))?;
    if events.is_empty() {
        return Err(PushError::new("storage_error", "session contains no events"));
    }

    let tags = merge_tags(&cfg.remote.default_tags, &payload.tags);
    let request = UploadRequest {
        session: UploadSession {
            session_id: payload.session_id,
            tool: payload.tool,
            created_at: meta.created_at,
            ended_at: meta.ended_at,
            cwd: meta.cwd,
            events,
        },
        tags,
    };

    push_to_remote(&cfg, &request).await
}

/// Read every well-formed event from the session log, deriving session
/// metadata the same way the local indexer does. A partial trailing line is
/// ignored; a non-JSON line fails the push.
pub fn read_session_events(path: &Path) -> std::io::Result<(Vec<UploadEvent>, SessionMeta)> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut buf = Vec::new();
    let mut events = Vec::new();
    let mut meta = SessionMeta::default();
    let mut earliest: Option<DateTime<Utc>> = None;
    let mut latest: Option<DateTime<Utc>> = None;

    loop {
        buf.clear();
        let n = reader.read_until(b'\n', &mut buf)?;
        if n == 0 {
            break;
        }
        if buf.last() != Some(&b'\n') {
            break;
        }
        let trimmed: Vec<u8> = {
            let start = buf
                .iter()
                .position(|b| !b.is_ascii_whitespace())
                .unwrap_or(buf.len());
            let end = buf
                .iter()
                .rposition(|b| !b.is_ascii_whitespace())
                .map_or(start, |i| i + 1);
            buf[start..end].to_vec()
        };
        if trimmed.is_empty() {
            continue;
        }

        let event: UploadEvent = serde_json::from_slice(&trimmed).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, "invalid event JSON")
        })?;
        if event.event_type.is_empty() || event.timestamp.is_empty() {
            continue;
        }

        if let Some(ts) = parse_rfc3339(&event.timestamp) {
            if earliest.map_or(true, |e| ts < e) {
                earliest = Some(ts);
            }
            if latest.map_or(true, |l| ts > l) {
                latest = Some(ts);
            }
        }

        match event.event_type.as_str() {
            EVENT_SESSION_START => {
                if meta.cwd.is_empty() {
                    if let Some(cwd) = event.data.get("cwd").and_then(Value::as_str) {
                        let cwd = cwd.trim();
                        if !cwd.is_empty() {
                            meta.cwd = cwd.to_string();
                        }
                    }
                }
            }
            EVENT_SESSION_END => {
                if meta.ended_at.is_empty() {
                    meta.ended_at = event.timestamp.clone();
                }
            }
            _ => {}
        }

        events.push(event);
    }

    if meta.created_at.is_empty() {
        if let Some(earliest) = earliest {
            meta.created_at = format_rfc3339(earliest);
        }
    }
    if meta.ended_at.is_empty() {
        if let Some(latest) = latest {
            meta.ended_at = format_rfc3339(latest);
        }
    }

    Ok((events, meta))
}

async fn push_to_remote(cfg: &Config, request: &UploadRequest) -> Result<PushResult, PushError> {
    let endpoint = format!(
        "{}/api/sessions",
        cfg.remote.server_url.trim_end_matches('/')
    );

    let client = reqwest::Client::builder()
        .timeout(UPLOAD_TIMEOUT)
        .build()
        .map_err(|_| PushError::new("network_error", "failed to create request"))?;

    let response = client
        .post(&endpoint)
        .bearer_auth(cfg.remote.api_key.trim())
        .json(request)
        .send()
        .await
        .map_err(|_| PushError::new("network_error", "failed to reach remote server"))?;

    let status = response.status();
    let body = response.bytes().await.unwrap_or_default();

    if status.is_success() {
        #[derive(Deserialize)]
        struct Created {
            #[serde(default)]
            id: String,
            #[serde(default)]
            url: String,
        }
        let created: Created = serde_json::from_slice(&body)
            .map_err(|_| PushError::new("storage_error", "invalid response from server"))?;
        return Ok(PushResult {
            remote_id: created.id,
            url: created.url,
        });
    }

    if status == reqwest::StatusCode::UNAUTHORIZED {
        return Err(PushError::new("invalid_api_key", "invalid or expired API key"));
    }
    if status == reqwest::StatusCode::CONFLICT {
        return Err(PushError::new("duplicate_session", "session already uploaded"));
    }

    #[derive(Deserialize)]
    struct RemoteError {
        error: RemoteErrorBody,
    }
    #[derive(Deserialize)]
    struct RemoteErrorBody {
        #[serde(default)]
        code: String,
        #[serde(default)]
        message: String,
    }
    if let Ok(parsed) = serde_json::from_slice::<RemoteError>(&body) {
        if !parsed.error.code.is_empty() {
            return Err(PushError {
                code: parsed.error.code,
                message: parsed.error.message,
            });
        }
    }
    Err(PushError::new("network_error", "remote server error"))
}
