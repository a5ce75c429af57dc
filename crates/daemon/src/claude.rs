//! Capture adapter for claude-code hooks: tails the external transcript
//! file from the cursor's byte offset, deduplicates by line hash, and
//! appends normalized events.

use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};
use tracing::warn;

use tabs_core::{
    EVENT_MESSAGE, EVENT_SESSION_END, EVENT_SESSION_START, EVENT_TOOL_RESULT, EVENT_TOOL_USE,
    TOOL_CLAUDE_CODE, build_event, get_str, normalize_content, parse_rfc3339, value_to_i64,
};

use crate::server::{CaptureOutcome, Daemon};
use crate::writer::{self, SessionCursor};
use crate::{DaemonError, Result};

pub(crate) async fn capture(
    daemon: &Daemon,
    event: &Map<String, Value>,
    session_id: &str,
    hook_time: DateTime<Utc>,
) -> Result<CaptureOutcome> {
    let mut inner = daemon.inner.lock().await;
    let base = daemon.base_dir();

    let mut cursor = writer::load_cursor_state(base, session_id).map_err(|err| {
        warn!(session_id, error = %err, "cursor state load failed");
        err
    })?;

    let transcript_path = extract_transcript_path(event)
        .map(str::to_string)
        .or_else(|| cursor.transcript_path.clone());
    let Some(transcript_path) = transcript_path.filter(|p| !p.is_empty()) else {
        return Err(DaemonError::InvalidPayload("missing transcript_path".into()));
    };
    cursor.transcript_path = Some(transcript_path);

    let session_path =
        inner
            .state
            .ensure_session_file(base, session_id, TOOL_CLAUDE_CODE, hook_time)?;

    let mut outcome = CaptureOutcome::default();

    if needs_session_start(&cursor) {
        let start = build_session_start_event(event, session_id, hook_time);
        let wrote_at = writer::append_event(&session_path, &mut cursor, &start)?;
        outcome.events_written += 1;
        outcome.observe(wrote_at);
    }

    let tail = append_transcript_tail(&session_path, session_id, &mut cursor, hook_time)?;
    outcome.events_written += tail.events_written;
    outcome.observe(tail.last_event_time);
    cursor.last_offset = tail.new_offset;
    if !tail.last_hash.is_empty() {
        cursor.last_line_hash = tail.last_hash;
    }

    if let Some(end) = build_session_end_event(event, session_id, hook_time, &cursor) {
        let wrote_at = writer::append_event(&session_path, &mut cursor, &end)?;
        outcome.events_written += 1;
        outcome.observe(wrote_at);
    }

    writer::save_cursor_state(base, &mut cursor)?;
    Ok(outcome)
}

pub(crate) fn needs_session_start(cursor: &SessionCursor) -> bool {
    cursor
        .metadata
        .as_ref()
        .map_or(true, |md| md.created_at.is_empty())
}

pub(crate) fn extract_transcript_path(event: &Map<String, Value>) -> Option<&str> {
    if let Some(path) = get_str(event, &["transcript_path"]) {
        return Some(path);
    }
    event
        .get("data")
        .and_then(Value::as_object)
        .and_then(|data| get_str(data, &["transcript_path"]))
}

pub(crate) fn hook_timestamp(event: &Map<String, Value>, fallback: DateTime<Utc>) -> DateTime<Utc> {
    get_str(event, &["timestamp"])
        .and_then(parse_rfc3339)
        .unwrap_or(fallback)
}

fn build_session_start_event(
    event: &Map<String, Value>,
    session_id: &str,
    hook_time: DateTime<Utc>,
) -> Value {
    let mut data = Map::new();
    for field in ["cwd", "permission_mode", "model"] {
        if let Some(value) = get_str(event, &[field]) {
            data.insert(field.to_string(), Value::String(value.to_string()));
        }
    }
    if data.is_empty() {
        data.insert("metadata".to_string(), json!({}));
    }
    build_event(
        EVENT_SESSION_START,
        session_id,
        TOOL_CLAUDE_CODE,
        hook_timestamp(event, hook_time),
        Value::Object(data),
    )
}

/// Synthesize a session_end from the hook payload when the session has not
/// ended yet and the hook carries end-of-session fields.
fn build_session_end_event(
    event: &Map<String, Value>,
    session_id: &str,
    hook_time: DateTime<Utc>,
    cursor: &SessionCursor,
) -> Option<Value> {
    if let Some(md) = cursor.metadata.as_ref() {
        if !md.ended_at.is_empty() {
            return None;
        }
    }
    let mut data = Map::new();
    if let Some(ctx) = event
        .get("file_context")
        .or_else(|| event.get("fileContext"))
        .and_then(Value::as_object)
    {
        data.insert("file_context".to_string(), Value::Object(ctx.clone()));
    }
    for field in ["duration_seconds", "message_count", "tool_use_count"] {
        if let Some(value) = event.get(field).and_then(value_to_i64) {
            data.insert(field.to_string(), Value::from(value));
        }
    }
    if data.is_empty() {
        return None;
    }
    Some(build_event(
        EVENT_SESSION_END,
        session_id,
        TOOL_CLAUDE_CODE,
        hook_timestamp(event, hook_time),
        Value::Object(data),
    ))
}

struct TailOutcome {
    events_written: u64,
    last_event_time: Option<DateTime<Utc>>,
    new_offset: u64,
    last_hash: String,
}

/// Read the transcript from the cursor offset, emitting events for every
/// complete new line. A partial last line (no trailing newline) is left for
/// the next capture; a shrunken file resets the cursor to byte zero.
fn append_transcript_tail(
    session_path: &Path,
    session_id: &str,
    cursor: &mut SessionCursor,
    hook_time: DateTime<Utc>,
) -> Result<TailOutcome> {
    let transcript_path = cursor.transcript_path.clone().unwrap_or_default();
    let unchanged = |cursor: &SessionCursor| TailOutcome {
        events_written: 0,
        last_event_time: None,
        new_offset: cursor.last_offset,
        last_hash: cursor.last_line_hash.clone(),
    };
    if transcript_path.is_empty() {
        return Ok(unchanged(cursor));
    }

    let mut file = match File::open(&transcript_path) {
        Ok(file) => file,
        // The transcript may not exist yet (SessionStart fires first); the
        // cursor keeps the path so a later hook picks it up.
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(unchanged(cursor));
        }
        Err(err) => return Err(err.into()),
    };

    let size = file.metadata()?.len();
    let mut offset = cursor.last_offset;
    let mut last_hash = cursor.last_line_hash.clone();
    if offset > size {
        offset = 0;
        last_hash.clear();
    }
    if offset > 0 {
        file.seek(SeekFrom::Start(offset))?;
    }

    let mut reader = BufReader::new(file);
    let mut buf = Vec::new();
    let mut events_written = 0u64;
    let mut last_event_time: Option<DateTime<Utc>> = None;

    loop {
        buf.clear();
        let n = reader.read_until(b'\n', &mut buf)?;
        if n == 0 {
            break;
        }
        if buf.last() != Some(&b'\n') {
            // Partial line at EOF: do not consume it.
            break;
        }
        offset += n as u64;

        let trimmed = trim_ascii(&buf);
        if trimmed.is_empty() {
            continue;
        }
        let line_hash = writer::hash_line(trimmed);
        let replay = line_hash == cursor.last_line_hash;
        last_hash = line_hash;
        if replay {
            continue;
        }

        let (events, line_time) = match events_from_line(trimmed, session_id, hook_time) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(session_id, error = %err, "failed to parse transcript line");
                continue;
            }
        };
        if let Some(line_time) = line_time {
            last_event_time = Some(last_event_time.map_or(line_time, |t| t.max(line_time)));
        }
        for event in events {
            let wrote_at = writer::append_event(session_path, cursor, &event)?;
            events_written += 1;
            if let Some(wrote_at) = wrote_at {
                last_event_time =
                    Some(last_event_time.map_or(wrote_at, |t| t.max(wrote_at)));
            }
        }
    }

    Ok(TailOutcome {
        events_written,
        last_event_time,
        new_offset: offset,
        last_hash,
    })
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}

/// Normalize one transcript record into zero or more canonical events.
fn events_from_line(
    line: &[u8],
    session_id: &str,
    fallback: DateTime<Utc>,
) -> std::result::Result<(Vec<Value>, Option<DateTime<Utc>>), serde_json::Error> {
    let record: Map<String, Value> = serde_json::from_slice(line)?;
    let ts = hook_timestamp(&record, fallback);
    let mut events = Vec::new();

    if let Some(role) = record_role(&record) {
        let content = normalize_content(message_content(&record));
        if !content.is_empty() {
            let mut data = Map::new();
            data.insert("role".to_string(), Value::String(role.to_string()));
            data.insert("content".to_string(), Value::Array(content));
            if role == "assistant" {
                if let Some(model) = message_model(&record) {
                    data.insert("model".to_string(), Value::String(model.to_string()));
                }
            }
            events.push(build_event(
                EVENT_MESSAGE,
                session_id,
                TOOL_CLAUDE_CODE,
                ts,
                Value::Object(data),
            ));
        }
    }

    for block in content_blocks(&record, "tool_use") {
        let tool_use_id = get_str(block, &["id", "tool_use_id"]).unwrap_or_default();
        let tool_name = get_str(block, &["name", "tool_name"]).unwrap_or_default();
        if tool_use_id.is_empty() || tool_name.is_empty() {
            continue;
        }
        events.push(build_event(
            EVENT_TOOL_USE,
            session_id,
            TOOL_CLAUDE_CODE,
            ts,
            json!({
                "tool_use_id": tool_use_id,
                "tool_name": tool_name,
                "input": block.get("input").cloned().unwrap_or(Value::Null),
            }),
        ));
    }

    for block in content_blocks(&record, "tool_result") {
        let tool_use_id = get_str(block, &["tool_use_id", "id"]).unwrap_or_default();
        if tool_use_id.is_empty() {
            continue;
        }
        events.push(build_event(
            EVENT_TOOL_RESULT,
            session_id,
            TOOL_CLAUDE_CODE,
            ts,
            json!({
                "tool_use_id": tool_use_id,
                "content": block.get("content").cloned().unwrap_or(Value::Null),
                "is_error": block.get("is_error").and_then(Value::as_bool).unwrap_or(false),
            }),
        ));
    }

    Ok((events, Some(ts)))
}

fn record_role(record: &Map<String, Value>) -> Option<&str> {
    for field in ["type", "role"] {
        if let Some(value) = record.get(field).and_then(Value::as_str) {
            if value == "user" || value == "assistant" {
                return Some(value);
            }
        }
    }
    None
}

/// Prefer the nested `message.content` (the actual transcript shape), fall
/// back to top-level `content`.
fn message_content(record: &Map<String, Value>) -> &Value {
    if let Some(content) = record
        .get("message")
        .and_then(Value::as_object)
        .and_then(|message| message.get("content"))
    {
        if !content.is_null() {
            return content;
        }
    }
    record.get("content").unwrap_or(&Value::Null)
}

fn message_model(record: &Map<String, Value>) -> Option<&str> {
    record
        .get("message")
        .and_then(Value::as_object)
        .and_then(|message| get_str(message, &["model"]))
        .or_else(|| get_str(record, &["model"]))
}

fn content_blocks<'a>(
    record: &'a Map<String, Value>,
    block_type: &'a str,
) -> impl Iterator<Item = &'a Map<String, Value>> {
    message_content(record)
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(Value::as_object)
        .filter(move |block| {
            block.get("type").and_then(Value::as_str) == Some(block_type)
        })
}
