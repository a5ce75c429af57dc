//! Append-only session log writer and the per-session cursor sidecar.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tabs_core::{
    EVENT_MESSAGE, EVENT_SESSION_END, EVENT_SESSION_START, EVENT_TOOL_USE, event_str,
    event_timestamp, format_rfc3339, value_to_i64,
};

use crate::{DaemonError, Result, paths};

/// Append one JSON line to a session file under an exclusive advisory lock.
/// A missing trailing newline is added; the write is fsynced before the lock
/// is released. Returns the new file size.
pub fn append_jsonl(path: &Path, line: &[u8]) -> io::Result<u64> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .mode(0o600)
        .open(path)?;

    let fd = file.as_raw_fd();
    if unsafe { libc::flock(fd, libc::LOCK_EX) } != 0 {
        return Err(io::Error::last_os_error());
    }
    let result = write_locked(&file, line);
    unsafe {
        libc::flock(fd, libc::LOCK_UN);
    }
    result
}

fn write_locked(mut file: &std::fs::File, line: &[u8]) -> io::Result<u64> {
    file.write_all(line)?;
    if line.last() != Some(&b'\n') {
        file.write_all(b"\n")?;
    }
    file.sync_all()?;
    Ok(file.metadata()?.len())
}

/// Hex SHA-256 of a trimmed transcript line.
pub fn hash_line(line: &[u8]) -> String {
    let digest = Sha256::digest(line);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

/// Sidecar state tracking how much of an external transcript has been
/// consumed for a session, plus aggregated session metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionCursor {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript_path: Option<String>,
    #[serde(default)]
    pub last_offset: u64,
    #[serde(default)]
    pub last_line_hash: String,
    #[serde(default)]
    pub updated_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<SessionMetadata>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub session_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tool: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub created_at: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ended_at: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cwd: String,
    #[serde(default)]
    pub duration_seconds: i64,
    #[serde(default)]
    pub message_count: i64,
    #[serde(default)]
    pub tool_use_count: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub file_path: String,
}

impl SessionCursor {
    fn fresh(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            ..Self::default()
        }
    }
}

fn cursor_state_path(base: &Path, session_id: &str) -> PathBuf {
    paths::state_dir(base).join(format!("{}.json", session_id))
}

/// Load the cursor for a session, creating a fresh one when no sidecar
/// exists yet. A corrupt sidecar is a storage error.
pub fn load_cursor_state(base: &Path, session_id: &str) -> Result<SessionCursor> {
    let path = cursor_state_path(base, session_id);
    let data = match fs::read(&path) {
        Ok(data) => data,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Ok(SessionCursor::fresh(session_id));
        }
        Err(err) => return Err(err.into()),
    };
    let mut cursor: SessionCursor = serde_json::from_slice(&data)
        .map_err(|err| DaemonError::Storage(format!("decode cursor state: {}", err)))?;
    if cursor.session_id.is_empty() {
        cursor.session_id = session_id.to_string();
    }
    Ok(cursor)
}

/// Persist the cursor atomically (temp file + rename), stamping
/// `updated_at`.
pub fn save_cursor_state(base: &Path, cursor: &mut SessionCursor) -> Result<()> {
    cursor.updated_at = format_rfc3339(Utc::now());
    let data = serde_json::to_vec(cursor)?;
    let state_dir = paths::state_dir(base);
    let tmp = tempfile::NamedTempFile::new_in(&state_dir)?;
    {
        let mut file = tmp.as_file();
        file.write_all(&data)?;
        file.sync_all()?;
    }
    tmp.persist(cursor_state_path(base, &cursor.session_id))
        .map_err(|err| DaemonError::Io(err.error))?;
    Ok(())
}

/// Fold one appended event into the cursor's aggregated metadata.
pub fn update_cursor_metadata(cursor: &mut SessionCursor, event: &Value, file_path: &Path) {
    let md = cursor.metadata.get_or_insert_with(SessionMetadata::default);

    if md.session_id.is_empty() {
        if let Some(session_id) = event_str(event, "session_id") {
            md.session_id = session_id.to_string();
        }
    }
    if md.tool.is_empty() {
        if let Some(tool) = event_str(event, "tool") {
            md.tool = tool.to_string();
        }
    }
    if md.file_path.is_empty() {
        md.file_path = file_path.to_string_lossy().to_string();
    }

    let ts = event_timestamp(event);
    if md.created_at.is_empty() {
        if let Some(ts) = ts {
            md.created_at = format_rfc3339(ts);
        }
    }

    let event_type = event_str(event, "event_type").unwrap_or_default();
    let data = event.get("data");
    match event_type {
        EVENT_SESSION_START => {
            if let Some(cwd) = data.and_then(|d| d.get("cwd")).and_then(Value::as_str) {
                if !cwd.is_empty() {
                    md.cwd = cwd.to_string();
                }
            }
        }
        EVENT_MESSAGE => md.message_count += 1,
        EVENT_TOOL_USE => md.tool_use_count += 1,
        EVENT_SESSION_END => {
            if let Some(ts) = ts {
                md.ended_at = format_rfc3339(ts);
            }
            if let Some(data) = data {
                if let Some(value) = data.get("duration_seconds").and_then(value_to_i64) {
                    md.duration_seconds = value;
                }
                if let Some(value) = data.get("message_count").and_then(value_to_i64) {
                    md.message_count = value;
                }
                if let Some(value) = data.get("tool_use_count").and_then(value_to_i64) {
                    md.tool_use_count = value;
                }
            }
        }
        _ => {}
    }
}

/// Event timestamp used for last-event bookkeeping.
pub(crate) fn event_time(event: &Value) -> Option<DateTime<Utc>> {
    event_timestamp(event)
}

/// Append one canonical event to the session log and fold it into the
/// cursor metadata. Returns the event timestamp.
pub(crate) fn append_event(
    session_path: &Path,
    cursor: &mut SessionCursor,
    event: &Value,
) -> Result<Option<DateTime<Utc>>> {
    let line = serde_json::to_vec(event)?;
    append_jsonl(session_path, &line)?;
    update_cursor_metadata(cursor, event, session_path);
    Ok(event_time(event))
}
