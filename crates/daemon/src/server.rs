//! Unix-socket IPC server: newline-delimited JSON, one request per
//! connection, 5-second deadline.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use tabs_core::{is_supported_tool, parse_rfc3339};

use crate::state::State;
use crate::{DaemonError, claude, cursor, paths, push};

pub const PROTOCOL_VERSION: &str = "1.0";

const CONNECTION_DEADLINE: Duration = Duration::from_secs(5);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub version: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub version: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResponseError {
    pub code: String,
    pub message: String,
}

impl Response {
    pub fn ok(data: Value) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            status: "ok".to_string(),
            data: Some(data),
            error: None,
        }
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            status: "error".to_string(),
            data: None,
            error: Some(ResponseError {
                code: code.to_string(),
                message: message.into(),
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CapturePayload {
    #[serde(default)]
    pub tool: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub event: Option<Map<String, Value>>,
}

pub(crate) struct Inner {
    pub state: State,
}

/// The daemon: owns the base directory and the single mutex that serializes
/// every write path into session files and cursor state.
pub struct Daemon {
    base_dir: PathBuf,
    config_path: PathBuf,
    pub(crate) inner: Mutex<Inner>,
}

impl Daemon {
    pub fn new(base_dir: PathBuf, config_path: PathBuf) -> Self {
        Self {
            base_dir,
            config_path,
            inner: Mutex::new(Inner {
                state: State::new(),
            }),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub(crate) fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn socket_path(&self) -> PathBuf {
        paths::socket_path(&self.base_dir)
    }

    /// Bind the unix socket, replacing any stale socket file, and restrict
    /// it to the owning user.
    pub fn listen(&self) -> std::io::Result<UnixListener> {
        let socket_path = self.socket_path();
        match fs::remove_file(&socket_path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
        let listener = UnixListener::bind(&socket_path)?;
        fs::set_permissions(&socket_path, fs::Permissions::from_mode(0o600))?;
        Ok(listener)
    }

    /// Accept loop. SIGINT/SIGTERM close the listener, in-flight handlers
    /// get a bounded drain, then the socket file is removed.
    pub async fn run(self: Arc<Self>, listener: UnixListener) -> crate::Result<()> {
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut handlers = JoinSet::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            let daemon = Arc::clone(&self);
                            handlers.spawn(async move {
                                daemon.handle_conn(stream).await;
                            });
                        }
                        Err(err) => {
                            warn!(error = %err, "accept failed");
                        }
                    }
                    while handlers.try_join_next().is_some() {}
                }
                _ = sigint.recv() => break,
                _ = sigterm.recv() => break,
            }
        }

        info!("draining in-flight handlers");
        drop(listener);
        let drain = async {
            while handlers.join_next().await.is_some() {}
        };
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, drain).await.is_err() {
            warn!("shutdown timeout reached, aborting remaining handlers");
            handlers.abort_all();
        }

        match fs::remove_file(self.socket_path()) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        Ok(())
    }

    async fn handle_conn(self: Arc<Self>, mut stream: UnixStream) {
        let result = tokio::time::timeout(CONNECTION_DEADLINE, async {
            let (read_half, mut write_half) = stream.split();
            let mut reader = BufReader::new(read_half);
            let mut line = String::new();
            if reader.read_line(&mut line).await? == 0 {
                return Ok::<_, std::io::Error>(());
            }

            let response = self.dispatch(&line).await;
            let mut payload = match serde_json::to_vec(&response) {
                Ok(payload) => payload,
                Err(err) => {
                    error!(error = %err, "marshal response failed");
                    return Ok(());
                }
            };
            payload.push(b'\n');
            write_half.write_all(&payload).await?;
            Ok(())
        })
        .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "connection error"),
            Err(_) => warn!("connection deadline exceeded"),
        }
    }

    /// Parse one request line and dispatch it. Public so tests can drive
    /// the full protocol without a socket.
    pub async fn dispatch(&self, line: &str) -> Response {
        let request: Request = match serde_json::from_str(line.trim()) {
            Ok(request) => request,
            Err(_) => return Response::error("invalid_json", "Invalid JSON request"),
        };
        if request.version != PROTOCOL_VERSION {
            return Response::error("unsupported_version", "Unsupported protocol version");
        }
        match request.kind.as_str() {
            "capture_event" => self.handle_capture(request.payload).await,
            "push_session" => self.handle_push(request.payload).await,
            "daemon_status" => self.handle_status().await,
            _ => Response::error("unsupported_type", "Unsupported request type"),
        }
    }

    async fn handle_capture(&self, payload: Value) -> Response {
        let payload: CapturePayload = match serde_json::from_value(payload) {
            Ok(payload) => payload,
            Err(_) => return Response::error("invalid_payload", "Invalid capture payload"),
        };
        if !is_supported_tool(&payload.tool) {
            return Response::error("unknown_tool", "Unsupported tool");
        }
        let Some(event) = payload.event.as_ref() else {
            return Response::error("invalid_payload", "Missing event payload");
        };
        let session_id = match event.get("session_id").and_then(Value::as_str) {
            Some(session_id) if !session_id.is_empty() => session_id.to_string(),
            _ => {
                return Response::error(
                    "invalid_payload",
                    "Missing required field: session_id",
                );
            }
        };

        let event_time = parse_rfc3339(&payload.timestamp).unwrap_or_else(Utc::now);

        let outcome = if payload.tool == tabs_core::TOOL_CLAUDE_CODE {
            claude::capture(self, event, &session_id, event_time).await
        } else {
            cursor::capture_hook(self, event, &session_id, event_time).await
        };

        match outcome {
            Ok(outcome) => {
                if outcome.events_written > 0 {
                    let mut inner = self.inner.lock().await;
                    inner.state.record_event(
                        &session_id,
                        outcome.last_event_time,
                        outcome.events_written,
                    );
                }
                Response::ok(json!({
                    "session_id": session_id,
                    "events_written": outcome.events_written,
                }))
            }
            Err(DaemonError::InvalidPayload(message)) => {
                Response::error("invalid_payload", message)
            }
            Err(err) => Response::error("storage_error", err.to_string()),
        }
    }

    async fn handle_push(&self, payload: Value) -> Response {
        let payload: push::PushPayload = match serde_json::from_value(payload) {
            Ok(payload) => payload,
            Err(_) => return Response::error("invalid_payload", "Invalid push payload"),
        };
        match push::push_session(&self.base_dir, self.config_path(), payload).await {
            Ok(result) => Response::ok(json!({
                "remote_id": result.remote_id,
                "url": result.url,
            })),
            Err(err) => Response::error(&err.code, err.message),
        }
    }

    async fn handle_status(&self) -> Response {
        let inner = self.inner.lock().await;
        let status = inner.state.snapshot(std::process::id());
        match serde_json::to_value(status) {
            Ok(data) => Response::ok(data),
            Err(err) => Response::error("storage_error", err.to_string()),
        }
    }
}

/// Outcome of one capture: how many events were appended and the latest
/// event timestamp observed.
#[derive(Debug, Default, Clone, Copy)]
pub struct CaptureOutcome {
    pub events_written: u64,
    pub last_event_time: Option<chrono::DateTime<Utc>>,
}

impl CaptureOutcome {
    pub(crate) fn observe(&mut self, ts: Option<chrono::DateTime<Utc>>) {
        if let Some(ts) = ts {
            if self.last_event_time.map_or(true, |last| ts > last) {
                self.last_event_time = Some(ts);
            }
        }
    }
}
