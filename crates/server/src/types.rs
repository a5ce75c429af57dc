//! Wire and storage types for the remote server.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tabs_core::Tag;

#[derive(Debug, Deserialize)]
pub struct UploadRequest {
    pub session: UploadSession,
    #[serde(default)]
    pub tags: Vec<Tag>,
}

#[derive(Debug, Deserialize)]
pub struct UploadSession {
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub tool: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub ended_at: String,
    #[serde(default)]
    pub cwd: String,
    #[serde(default)]
    pub events: Vec<WireEvent>,
}

#[derive(Debug, Deserialize)]
pub struct WireEvent {
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

/// The typed session document materialized by the normalizer before any
/// database writes.
#[derive(Debug)]
pub struct NormalizedSession {
    pub tool: String,
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub cwd: String,
    pub duration_seconds: Option<i64>,
    pub message_count: i64,
    pub tool_use_count: i64,
    pub messages: Vec<MessageRecord>,
    pub tools: Vec<ToolRecord>,
    pub tags: Vec<Tag>,
}

#[derive(Debug)]
pub struct MessageRecord {
    pub timestamp: DateTime<Utc>,
    pub seq: i64,
    pub role: String,
    pub model: Option<String>,
    pub content: Value,
}

#[derive(Debug, Default)]
pub struct ToolRecord {
    pub timestamp: Option<DateTime<Utc>>,
    pub tool_use_id: String,
    pub tool_name: String,
    pub input: Value,
    pub output: Option<Value>,
    pub is_error: bool,
}

#[derive(Debug, Clone)]
pub struct ApiKeyRecord {
    pub id: String,
    pub user_id: String,
}

#[derive(Debug, Default)]
pub struct SessionFilter {
    pub tool: String,
    pub uploaded_by: String,
    pub query: String,
    pub tags: Vec<Tag>,
    pub page: i64,
    pub limit: i64,
    pub sort: String,
    pub order: String,
}

#[derive(Debug, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub tool: String,
    pub session_id: String,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<String>,
    pub cwd: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uploaded_by: Option<String>,
    pub uploaded_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<i64>,
    pub message_count: i64,
    pub tool_use_count: i64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub summary: String,
    pub tags: Vec<Tag>,
}

#[derive(Debug, Serialize)]
pub struct SessionDetail {
    #[serde(flatten)]
    pub summary: SessionSummary,
    pub messages: Vec<MessageDetail>,
    pub tools: Vec<ToolDetail>,
}

#[derive(Debug, Serialize)]
pub struct MessageDetail {
    pub id: i64,
    pub timestamp: String,
    pub seq: i64,
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub content: Value,
}

#[derive(Debug, Serialize)]
pub struct ToolDetail {
    pub id: i64,
    pub timestamp: String,
    pub tool_use_id: String,
    pub tool_name: String,
    pub input: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    pub is_error: bool,
}

#[derive(Debug, Serialize)]
pub struct TagCount {
    pub key: String,
    pub value: String,
    pub count: i64,
}

#[derive(Debug, Serialize)]
pub struct Pagination {
    pub page: i64,
    pub limit: i64,
    pub total_pages: i64,
}
