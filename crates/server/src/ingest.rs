//! Upload validation, normalization, and the transactional insert.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use tabs_core::{
    EVENT_MESSAGE, EVENT_SESSION_END, EVENT_SESSION_START, EVENT_TOOL_RESULT, EVENT_TOOL_USE,
    Tag, dedupe_tags, format_rfc3339, is_supported_tool, parse_rfc3339,
};

use crate::db::{Db, is_unique_violation};
use crate::errors::{ApiError, Result};
use crate::types::{
    ApiKeyRecord, MessageRecord, NormalizedSession, ToolRecord, UploadRequest,
};

pub const API_KEY_PREFIX: &str = "tabs_";

pub fn hash_api_key(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    digest.iter().map(|byte| format!("{:02x}", byte)).collect()
}

pub fn parse_bearer_token(header: &str) -> Result<&str> {
    let mut parts = header.split_whitespace();
    let (scheme, token) = (parts.next(), parts.next());
    match (scheme, token, parts.next()) {
        (Some(scheme), Some(token), None)
            if scheme.eq_ignore_ascii_case("bearer") && !token.is_empty() =>
        {
            Ok(token)
        }
        _ => Err(ApiError::InvalidApiKey),
    }
}

impl Db {
    /// Resolve a bearer key to its record, rejecting unknown, inactive, and
    /// expired keys.
    pub fn lookup_api_key(&self, key: &str) -> Result<ApiKeyRecord> {
        if !key.starts_with(API_KEY_PREFIX) {
            return Err(ApiError::InvalidApiKey);
        }
        let hash = hash_api_key(key);
        let row = self
            .conn
            .prepare(
                "SELECT id, user_id, is_active, expires_at FROM api_keys WHERE key_hash = ?1",
            )?
            .query_row([&hash], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, bool>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            })
            .optional()?;

        let Some((id, user_id, is_active, expires_at)) = row else {
            return Err(ApiError::InvalidApiKey);
        };
        if !is_active {
            return Err(ApiError::InvalidApiKey);
        }
        if let Some(expires_at) = expires_at.as_deref().and_then(parse_rfc3339) {
            if Utc::now() > expires_at {
                return Err(ApiError::InvalidApiKey);
            }
        }
        Ok(ApiKeyRecord { id, user_id })
    }

    pub fn session_exists(&self, tool: &str, session_id: &str) -> Result<bool> {
        let exists = self
            .conn
            .prepare("SELECT 1 FROM sessions WHERE tool = ?1 AND session_id = ?2")?
            .exists(params![tool, session_id])?;
        Ok(exists)
    }

    /// Persist the normalized session in a single transaction: session row,
    /// messages in observed order, tools by timestamp, deduped tags, and
    /// the API key usage bump.
    pub fn store_session(
        &mut self,
        session: &NormalizedSession,
        key: &ApiKeyRecord,
    ) -> Result<String> {
        let tx = self.conn.transaction()?;
        let remote_id = Uuid::new_v4().to_string();

        let inserted = tx.execute(
            "INSERT INTO sessions (
                id, tool, session_id, created_at, ended_at, cwd, uploaded_by,
                api_key_id, duration_seconds, message_count, tool_use_count
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                remote_id,
                session.tool,
                session.session_id,
                format_rfc3339(session.created_at),
                session.ended_at.map(format_rfc3339),
                session.cwd,
                key.user_id,
                key.id,
                session.duration_seconds,
                session.message_count,
                session.tool_use_count,
            ],
        );
        if let Err(err) = inserted {
            if is_unique_violation(&err) {
                return Err(ApiError::DuplicateSession);
            }
            return Err(err.into());
        }

        {
            let mut stmt = tx.prepare(
                "INSERT INTO messages (session_id, timestamp, seq, role, model, content)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for msg in &session.messages {
                stmt.execute(params![
                    remote_id,
                    format_rfc3339(msg.timestamp),
                    msg.seq,
                    msg.role,
                    msg.model,
                    msg.content.to_string(),
                ])?;
            }
        }

        {
            let mut tools: Vec<&ToolRecord> = session.tools.iter().collect();
            tools.sort_by_key(|tool| tool.timestamp);
            let mut stmt = tx.prepare(
                "INSERT INTO tools (session_id, timestamp, tool_use_id, tool_name, input, output, is_error)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for tool in tools {
                let timestamp = tool.timestamp.unwrap_or(session.created_at);
                stmt.execute(params![
                    remote_id,
                    format_rfc3339(timestamp),
                    tool.tool_use_id,
                    tool.tool_name,
                    tool.input.to_string(),
                    tool.output.as_ref().map(Value::to_string),
                    tool.is_error,
                ])?;
            }
        }

        {
            let mut stmt = tx.prepare(
                "INSERT INTO tags (session_id, tag_key, tag_value) VALUES (?1, ?2, ?3)",
            )?;
            for tag in &session.tags {
                stmt.execute(params![remote_id, tag.key, tag.value])?;
            }
        }

        tx.execute(
            "UPDATE api_keys
             SET last_used_at = ?1, usage_count = usage_count + 1
             WHERE id = ?2",
            params![format_rfc3339(Utc::now()), key.id],
        )?;

        tx.commit()?;
        Ok(remote_id)
    }
}

fn invalid(message: &str) -> ApiError {
    ApiError::InvalidRequest(message.to_string())
}

/// Validate and normalize an upload into the typed session document.
pub fn normalize_upload(req: UploadRequest) -> Result<NormalizedSession> {
    let session = req.session;
    if session.session_id.is_empty() {
        return Err(invalid("missing session.session_id"));
    }
    if Uuid::parse_str(&session.session_id).is_err() {
        return Err(invalid("session.session_id must be a valid UUID"));
    }
    if !is_supported_tool(&session.tool) {
        return Err(invalid("session.tool must be claude-code or cursor"));
    }
    if session.events.is_empty() {
        return Err(invalid("session.events must not be empty"));
    }

    let mut cwd = session.cwd.trim().to_string();
    let mut created_at = match session.created_at.trim() {
        "" => None,
        raw => Some(parse_rfc3339(raw).ok_or_else(|| invalid("session.created_at must be RFC3339"))?),
    };
    let mut ended_at = match session.ended_at.trim() {
        "" => None,
        raw => Some(parse_rfc3339(raw).ok_or_else(|| invalid("session.ended_at must be RFC3339"))?),
    };

    let mut earliest: Option<DateTime<Utc>> = None;
    let mut latest: Option<DateTime<Utc>> = None;
    let mut messages = Vec::new();
    let mut tool_map: HashMap<String, ToolRecord> = HashMap::new();
    let mut tool_order: Vec<String> = Vec::new();
    let mut tool_use_count: i64 = 0;
    let mut seq: i64 = 0;
    let mut end_duration: Option<i64> = None;
    let mut end_message_count: Option<i64> = None;
    let mut end_tool_use_count: Option<i64> = None;

    for event in &session.events {
        if event.event_type.is_empty() {
            continue;
        }
        let ts = parse_rfc3339(&event.timestamp)
            .ok_or_else(|| invalid("event.timestamp must be RFC3339"))?;
        if earliest.map_or(true, |e| ts < e) {
            earliest = Some(ts);
        }
        if latest.map_or(true, |l| ts > l) {
            latest = Some(ts);
        }
        if !event.session_id.is_empty() && event.session_id != session.session_id {
            return Err(invalid("event.session_id must match session.session_id"));
        }
        if !event.tool.is_empty() && event.tool != session.tool {
            return Err(invalid("event.tool must match session.tool"));
        }

        match event.event_type.as_str() {
            EVENT_SESSION_START => {
                if cwd.is_empty() {
                    if let Some(value) = event.data.get("cwd").and_then(Value::as_str) {
                        cwd = value.trim().to_string();
                    }
                }
                if created_at.is_none() {
                    created_at = Some(ts);
                }
            }
            EVENT_SESSION_END => {
                if ended_at.is_none() {
                    ended_at = Some(ts);
                }
                let data = &event.data;
                if let Some(value) = data.get("duration_seconds").and_then(Value::as_i64) {
                    end_duration = Some(value);
                }
                if let Some(value) = data.get("message_count").and_then(Value::as_i64) {
                    end_message_count = Some(value);
                }
                if let Some(value) = data.get("tool_use_count").and_then(Value::as_i64) {
                    end_tool_use_count = Some(value);
                }
            }
            EVENT_MESSAGE => {
                let role = event
                    .data
                    .get("role")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if role != "user" && role != "assistant" {
                    return Err(invalid("message.role must be user or assistant"));
                }
                seq += 1;
                let model = event
                    .data
                    .get("model")
                    .and_then(Value::as_str)
                    .filter(|model| !model.is_empty())
                    .map(str::to_string);
                messages.push(MessageRecord {
                    timestamp: ts,
                    seq,
                    role: role.to_string(),
                    model,
                    content: event.data.get("content").cloned().unwrap_or(json!([])),
                });
            }
            EVENT_TOOL_USE => {
                let tool_use_id = event
                    .data
                    .get("tool_use_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let tool_name = event
                    .data
                    .get("tool_name")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if tool_use_id.is_empty() || tool_name.is_empty() {
                    return Err(invalid("tool_use requires tool_use_id and tool_name"));
                }
                let record = tool_map.entry(tool_use_id.to_string()).or_insert_with(|| {
                    tool_order.push(tool_use_id.to_string());
                    ToolRecord {
                        tool_use_id: tool_use_id.to_string(),
                        ..ToolRecord::default()
                    }
                });
                record.timestamp = Some(ts);
                record.tool_name = tool_name.to_string();
                record.input = event.data.get("input").cloned().unwrap_or(Value::Null);
                tool_use_count += 1;
            }
            EVENT_TOOL_RESULT => {
                let tool_use_id = event
                    .data
                    .get("tool_use_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if tool_use_id.is_empty() {
                    return Err(invalid("tool_result requires tool_use_id"));
                }
                let record = tool_map.entry(tool_use_id.to_string()).or_insert_with(|| {
                    tool_order.push(tool_use_id.to_string());
                    ToolRecord {
                        tool_use_id: tool_use_id.to_string(),
                        ..ToolRecord::default()
                    }
                });
                // A result before its use keeps the result's timestamp.
                if record.timestamp.is_none() {
                    record.timestamp = Some(ts);
                }
                record.output = Some(wrap_output(event.data.get("content")));
                record.is_error = event
                    .data
                    .get("is_error")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
            }
            _ => {}
        }
    }

    let created_at = created_at
        .or(earliest)
        .ok_or_else(|| invalid("missing session.created_at"))?;
    let ended_at = ended_at.or(latest);
    if cwd.is_empty() {
        return Err(invalid("missing session.cwd"));
    }

    let message_count = end_message_count.unwrap_or(messages.len() as i64);
    let tool_use_count = end_tool_use_count.unwrap_or(tool_use_count);
    let duration_seconds = end_duration.or_else(|| {
        ended_at.map(|ended| (ended - created_at).num_seconds().max(0))
    });

    let mut tools = Vec::with_capacity(tool_order.len());
    for tool_use_id in tool_order {
        let Some(record) = tool_map.remove(&tool_use_id) else {
            continue;
        };
        if record.tool_name.is_empty() {
            return Err(invalid("tool_result without tool_name"));
        }
        tools.push(record);
    }

    Ok(NormalizedSession {
        tool: session.tool,
        session_id: session.session_id,
        created_at,
        ended_at,
        cwd,
        duration_seconds,
        message_count,
        tool_use_count,
        messages,
        tools,
        tags: dedupe_tags(&req.tags),
    })
}

/// Tool results are stored JSON-wrapped so plain strings and structured
/// payloads land in the same column shape.
fn wrap_output(content: Option<&Value>) -> Value {
    match content {
        Some(Value::String(text)) if text.is_empty() => Value::Null,
        Some(Value::String(text)) => json!({ "content": text }),
        Some(Value::Null) | None => Value::Null,
        Some(other) => json!({ "content": other.to_string() }),
    }
}
