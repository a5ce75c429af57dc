//! Client side of the daemon's unix-socket protocol.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use tabs_daemon::{PROTOCOL_VERSION, Status, paths};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub enum IpcError {
    /// Daemon unreachable: socket missing or connection refused.
    Unavailable(std::io::Error),
    /// The daemon answered with an error envelope.
    Daemon { code: String, message: String },
    /// Malformed response.
    Protocol(String),
}

impl std::fmt::Display for IpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IpcError::Unavailable(err) => write!(f, "daemon unavailable: {}", err),
            IpcError::Daemon { code, message } => write!(f, "{}: {}", code, message),
            IpcError::Protocol(message) => write!(f, "invalid response: {}", message),
        }
    }
}

impl std::error::Error for IpcError {}

pub struct DaemonClient {
    socket_path: PathBuf,
}

impl DaemonClient {
    pub fn new(base_dir: &Path) -> Self {
        Self {
            socket_path: paths::socket_path(base_dir),
        }
    }

    async fn request(
        &self,
        kind: &str,
        payload: Value,
        deadline: Duration,
    ) -> Result<Value, IpcError> {
        let connect = tokio::time::timeout(CONNECT_TIMEOUT, UnixStream::connect(&self.socket_path))
            .await
            .map_err(|_| {
                IpcError::Unavailable(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "connect timeout",
                ))
            })?;
        let mut stream = connect.map_err(IpcError::Unavailable)?;

        let exchange = async {
            let request = json!({
                "version": PROTOCOL_VERSION,
                "type": kind,
                "payload": payload,
            });
            let mut line = serde_json::to_vec(&request)
                .map_err(|err| IpcError::Protocol(err.to_string()))?;
            line.push(b'\n');
            stream
                .write_all(&line)
                .await
                .map_err(IpcError::Unavailable)?;

            let (read_half, _) = stream.split();
            let mut reader = BufReader::new(read_half);
            let mut response_line = String::new();
            reader
                .read_line(&mut response_line)
                .await
                .map_err(IpcError::Unavailable)?;
            serde_json::from_str::<Value>(&response_line)
                .map_err(|err| IpcError::Protocol(err.to_string()))
        };
        let response = tokio::time::timeout(deadline, exchange)
            .await
            .map_err(|_| IpcError::Protocol("response deadline exceeded".to_string()))??;

        if response.get("status").and_then(Value::as_str) == Some("ok") {
            return Ok(response.get("data").cloned().unwrap_or(Value::Null));
        }
        let error = response.get("error").cloned().unwrap_or_default();
        Err(IpcError::Daemon {
            code: error
                .get("code")
                .and_then(Value::as_str)
                .unwrap_or("server_error")
                .to_string(),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("request failed")
                .to_string(),
        })
    }

    pub async fn daemon_status(&self) -> Result<Status, IpcError> {
        let data = self
            .request("daemon_status", json!({}), Duration::from_secs(5))
            .await?;
        serde_json::from_value(data).map_err(|err| IpcError::Protocol(err.to_string()))
    }

    pub async fn push_session(&self, payload: Value) -> Result<Value, IpcError> {
        self.request("push_session", payload, Duration::from_secs(30))
            .await
    }
}
