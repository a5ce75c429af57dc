//! Shared types and helpers for the tabs capture pipeline.
//!
//! Events stay schemaless (`serde_json::Value` objects) inside the local
//! session logs; this crate holds the canonical field vocabulary plus the
//! handful of parsing helpers every process needs.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

pub const TOOL_CLAUDE_CODE: &str = "claude-code";
pub const TOOL_CURSOR: &str = "cursor";

pub const EVENT_SESSION_START: &str = "session_start";
pub const EVENT_SESSION_END: &str = "session_end";
pub const EVENT_MESSAGE: &str = "message";
pub const EVENT_TOOL_USE: &str = "tool_use";
pub const EVENT_TOOL_RESULT: &str = "tool_result";

pub fn is_supported_tool(tool: &str) -> bool {
    matches!(tool, TOOL_CLAUDE_CODE | TOOL_CURSOR)
}

/// Parse an RFC3339 timestamp, accepting both nanosecond and plain forms.
pub fn parse_rfc3339(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

/// Canonical wire form: RFC3339 UTC with subsecond digits only when the
/// timestamp carries them (the nanosecond form used across the pipeline).
pub fn format_rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Build a canonical event object.
pub fn build_event(
    event_type: &str,
    session_id: &str,
    tool: &str,
    ts: DateTime<Utc>,
    data: Value,
) -> Value {
    json!({
        "event_type": event_type,
        "timestamp": format_rfc3339(ts),
        "tool": tool,
        "session_id": session_id,
        "data": data,
    })
}

/// First string value found under any of the given keys.
pub fn get_str<'a>(map: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    for key in keys {
        if let Some(value) = map.get(*key).and_then(Value::as_str) {
            if !value.is_empty() {
                return Some(value);
            }
        }
    }
    None
}

pub fn event_str<'a>(event: &'a Value, field: &str) -> Option<&'a str> {
    event.get(field).and_then(Value::as_str)
}

pub fn event_timestamp(event: &Value) -> Option<DateTime<Utc>> {
    event_str(event, "timestamp").and_then(parse_rfc3339)
}

/// Lenient integer coercion for count fields that arrive as numbers or
/// numeric strings.
pub fn value_to_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Normalize raw message content into `{type, text}` parts. Accepts a plain
/// string, an array of strings, or an array of content blocks; keeps `text`
/// and `thinking` blocks and drops everything else (tool blocks are handled
/// separately).
pub fn normalize_content(raw: &Value) -> Vec<Value> {
    match raw {
        Value::Array(items) => {
            let mut parts = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::Object(block) => {
                        let Some(part_type) = block.get("type").and_then(Value::as_str) else {
                            continue;
                        };
                        let text = match part_type {
                            "text" => block.get("text").and_then(Value::as_str),
                            "thinking" => block.get("thinking").and_then(Value::as_str),
                            _ => continue,
                        };
                        let Some(text) = text.filter(|t| !t.is_empty()) else {
                            continue;
                        };
                        parts.push(json!({ "type": part_type, "text": text }));
                    }
                    Value::String(text) if !text.is_empty() => {
                        parts.push(json!({ "type": "text", "text": text }));
                    }
                    _ => {}
                }
            }
            parts
        }
        Value::String(text) if !text.is_empty() => {
            vec![json!({ "type": "text", "text": text })]
        }
        _ => Vec::new(),
    }
}

/// Flatten message content into display text for summaries.
pub fn extract_text(raw: &Value) -> String {
    match raw {
        Value::String(text) => text.trim().to_string(),
        Value::Array(items) => {
            let mut parts = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::String(text) => parts.push(text.as_str()),
                    Value::Object(block) => {
                        if let Some(text) = block.get("text").and_then(Value::as_str) {
                            if !text.is_empty() {
                                parts.push(text);
                            }
                        }
                    }
                    _ => {}
                }
            }
            parts.join("\n").trim().to_string()
        }
        _ => String::new(),
    }
}

/// Trim a summary excerpt to `limit` characters, appending an ellipsis when
/// content was cut. Operates on characters so multi-byte text stays valid.
pub fn trim_summary(value: &str, limit: usize) -> String {
    let value = value.trim();
    if value.chars().count() <= limit {
        return value.to_string();
    }
    let cut: String = value.chars().take(limit).collect();
    format!("{}...", cut.trim_end())
}

/// Case-insensitive substring search through every string nested in a value.
pub fn contains_query(value: &Value, query: &str) -> bool {
    match value {
        Value::String(s) => s.to_lowercase().contains(query),
        Value::Array(items) => items.iter().any(|item| contains_query(item, query)),
        Value::Object(map) => map.values().any(|item| contains_query(item, query)),
        _ => false,
    }
}

/// A `(key, value)` pair attached to a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    fn compound(&self) -> String {
        format!("{}:{}", self.key, self.value)
    }
}

/// Parse a `key:value` (or `key=value`) tag string.
pub fn parse_tag_string(raw: &str) -> Option<Tag> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let (key, value) = trimmed
        .split_once(':')
        .or_else(|| trimmed.split_once('='))?;
    let key = key.trim();
    let value = value.trim();
    if key.is_empty() || value.is_empty() {
        return None;
    }
    Some(Tag::new(key, value))
}

/// Merge configured default tags with caller tags, deduplicating on the
/// compound `key:value`. Defaults win the first slot; order is preserved.
pub fn merge_tags(defaults: &[String], tags: &[Tag]) -> Vec<Tag> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::with_capacity(defaults.len() + tags.len());

    for entry in defaults {
        if let Some(tag) = parse_tag_string(entry) {
            if seen.insert(tag.compound()) {
                out.push(tag);
            }
        }
    }
    for tag in tags {
        let key = tag.key.trim();
        let value = tag.value.trim();
        if key.is_empty() || value.is_empty() {
            continue;
        }
        let tag = Tag::new(key, value);
        if seen.insert(tag.compound()) {
            out.push(tag);
        }
    }
    out
}

/// Deduplicate tags on the compound `key:value`, trimming whitespace.
pub fn dedupe_tags(tags: &[Tag]) -> Vec<Tag> {
    merge_tags(&[], tags)
}
