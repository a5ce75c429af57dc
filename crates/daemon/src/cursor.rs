//! Capture adapter for Cursor. Two entry points share the write path: a
//! poll worker that diffs the active conversation out of Cursor's state
//! database, and direct `beforeSubmitPrompt`/`stop` hook events.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OpenFlags};
use serde_json::{Map, Value, json};
use tracing::{info, warn};

use tabs_core::{
    EVENT_MESSAGE, EVENT_SESSION_END, EVENT_SESSION_START, TOOL_CURSOR, build_event, get_str,
    parse_rfc3339,
};

use crate::claude::{hook_timestamp, needs_session_start};
use crate::server::{CaptureOutcome, Daemon};
use crate::writer;
use crate::Result;

/// Well-known row holding the active conversation JSON.
const CHAT_DATA_KEY: &str = "workbench.panel.aichat.view.aichat.chatdata";

#[derive(Debug, Default)]
pub struct CursorConversation {
    pub id: String,
    pub messages: Vec<CursorMessage>,
    pub workspace_roots: Vec<String>,
}

#[derive(Debug, Default)]
pub struct CursorMessage {
    pub role: String,
    pub content: String,
    pub timestamp: String,
}

pub(crate) async fn capture_hook(
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
    let session_path = inner
        .state
        .ensure_session_file(base, session_id, TOOL_CURSOR, hook_time)?;

    let mut outcome = CaptureOutcome::default();
    let hook_event = get_str(event, &["hook_event_name", "event"]).unwrap_or_default();

    if hook_event == "beforeSubmitPrompt" {
        if needs_session_start(&cursor) {
            let start = build_session_start(event, session_id, hook_time);
            let wrote_at = writer::append_event(&session_path, &mut cursor, &start)?;
            outcome.events_written += 1;
            outcome.observe(wrote_at);
        }
        if let Some(prompt) = get_str(event, &["prompt"]).map(str::trim) {
            if !prompt.is_empty() {
                let msg = build_message(session_id, hook_time, "user", prompt);
                let wrote_at = writer::append_event(&session_path, &mut cursor, &msg)?;
                outcome.events_written += 1;
                outcome.observe(wrote_at);
            }
        }
    }

    if hook_event == "stop" {
        let ended = cursor
            .metadata
            .as_ref()
            .map_or(false, |md| !md.ended_at.is_empty());
        if !ended {
            let end = build_session_end(event, session_id, hook_time);
            let wrote_at = writer::append_event(&session_path, &mut cursor, &end)?;
            outcome.events_written += 1;
            outcome.observe(wrote_at);
        }
    }

    writer::save_cursor_state(base, &mut cursor)?;
    Ok(outcome)
}

fn build_session_start(
    event: &Map<String, Value>,
    session_id: &str,
    hook_time: DateTime<Utc>,
) -> Value {
    let cwd = event
        .get("workspace_roots")
        .and_then(Value::as_array)
        .and_then(|roots| roots.first())
        .and_then(Value::as_str)
        .filter(|root| !root.is_empty());
    let data = match cwd {
        Some(cwd) => json!({ "cwd": cwd }),
        None => json!({ "metadata": {} }),
    };
    build_event(
        EVENT_SESSION_START,
        session_id,
        TOOL_CURSOR,
        hook_timestamp(event, hook_time),
        data,
    )
}

fn build_session_end(
    event: &Map<String, Value>,
    session_id: &str,
    hook_time: DateTime<Utc>,
) -> Value {
    let data = match get_str(event, &["generation_id"]) {
        Some(generation_id) => json!({ "generation_id": generation_id }),
        None => json!({ "metadata": {} }),
    };
    build_event(
        EVENT_SESSION_END,
        session_id,
        TOOL_CURSOR,
        hook_timestamp(event, hook_time),
        data,
    )
}

fn build_message(session_id: &str, ts: DateTime<Utc>, role: &str, content: &str) -> Value {
    build_event(
        EVENT_MESSAGE,
        session_id,
        TOOL_CURSOR,
        ts,
        json!({
            "role": role,
            "content": [{ "type": "text", "text": content }],
        }),
    )
}

/// Spawn the poll worker. Runs for the lifetime of the daemon.
pub fn spawn_poller(daemon: Arc<Daemon>, db_path: String, poll_interval: u64) {
    let interval = Duration::from_secs(poll_interval.max(1));
    tokio::spawn(async move {
        {
            let mut inner = daemon.inner.lock().await;
            inner.state.set_cursor_polling(true);
        }
        info!(db_path, interval_secs = interval.as_secs(), "cursor poller started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so the cadence matches
        // the configured interval.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(err) = poll_once(&daemon, &db_path).await {
                warn!(error = %err, "cursor poll error");
            }
        }
    });
}

/// One poll tick: open the external database read-only, parse the active
/// conversation, and append any new message suffix.
pub async fn poll_once(daemon: &Daemon, db_path: &str) -> Result<()> {
    let conversations = read_conversations(db_path)
        .map_err(|err| crate::DaemonError::Storage(format!("open cursor db: {}", err)))?;
    for conversation in conversations {
        if conversation.id.is_empty() {
            continue;
        }
        process_conversation(daemon, conversation).await;
    }
    Ok(())
}

fn read_conversations(db_path: &str) -> rusqlite::Result<Vec<CursorConversation>> {
    let conn = Connection::open_with_flags(
        db_path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    let mut stmt = conn.prepare("SELECT value FROM ItemTable WHERE [key] = ?1")?;
    let rows = stmt.query_map([CHAT_DATA_KEY], |row| row.get::<_, Vec<u8>>(0))?;

    let mut conversations = Vec::new();
    for raw in rows {
        let raw = raw?;
        if let Some(conversation) = parse_conversation(&raw) {
            conversations.push(conversation);
        }
    }
    Ok(conversations)
}

pub fn parse_conversation(raw: &[u8]) -> Option<CursorConversation> {
    let payload: Map<String, Value> = serde_json::from_slice(raw).ok()?;
    let id = get_str(&payload, &["conversation_id", "conversationId"])
        .unwrap_or_default()
        .to_string();
    let messages_raw = payload.get("messages")?.as_array()?;

    let messages = messages_raw
        .iter()
        .filter_map(Value::as_object)
        .map(|msg| CursorMessage {
            role: get_str(msg, &["role"]).unwrap_or_default().to_string(),
            content: get_str(msg, &["content"]).unwrap_or_default().to_string(),
            timestamp: get_str(msg, &["timestamp", "time", "created_at", "createdAt"])
                .unwrap_or_default()
                .to_string(),
        })
        .collect();

    let workspace_roots = ["workspace_roots", "workspaceRoots"]
        .iter()
        .filter_map(|key| payload.get(*key).and_then(Value::as_array))
        .next()
        .map(|roots| {
            roots
                .iter()
                .filter_map(Value::as_str)
                .filter(|root| !root.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Some(CursorConversation {
        id,
        messages,
        workspace_roots,
    })
}

async fn process_conversation(daemon: &Daemon, conversation: CursorConversation) {
    let mut inner = daemon.inner.lock().await;
    let base = daemon.base_dir();
    let session_id = conversation.id.as_str();

    let mut cursor = match writer::load_cursor_state(base, session_id) {
        Ok(cursor) => cursor,
        Err(err) => {
            warn!(session_id, error = %err, "cursor state load failed");
            return;
        }
    };
    if conversation.messages.is_empty() {
        return;
    }

    if needs_session_start(&cursor) {
        let cwd = conversation
            .workspace_roots
            .first()
            .filter(|root| !root.is_empty());
        let data = match cwd {
            Some(cwd) => json!({ "cwd": cwd }),
            None => json!({ "metadata": {} }),
        };
        let now = Utc::now();
        let start = build_event(EVENT_SESSION_START, session_id, TOOL_CURSOR, now, data);
        if let Ok(session_path) = inner
            .state
            .ensure_session_file(base, session_id, TOOL_CURSOR, now)
        {
            if writer::append_event(&session_path, &mut cursor, &start).is_ok() {
                inner.state.record_event(session_id, Some(now), 1);
            }
        }
    }

    let message_count = cursor
        .metadata
        .as_ref()
        .map(|md| md.message_count.max(0) as usize)
        .unwrap_or(0);
    if message_count >= conversation.messages.len() {
        return;
    }

    let now = Utc::now();
    let session_path = match inner
        .state
        .ensure_session_file(base, session_id, TOOL_CURSOR, now)
    {
        Ok(path) => path,
        Err(_) => return,
    };

    let mut written = 0u64;
    let mut last_event_time: Option<DateTime<Utc>> = None;
    for msg in &conversation.messages[message_count..] {
        if msg.role.is_empty() || msg.content.is_empty() {
            continue;
        }
        let ts = parse_rfc3339(&msg.timestamp).unwrap_or_else(Utc::now);
        let event = build_message(session_id, ts, &msg.role, &msg.content);
        match writer::append_event(&session_path, &mut cursor, &event) {
            Ok(wrote_at) => {
                written += 1;
                if let Some(wrote_at) = wrote_at {
                    last_event_time =
                        Some(last_event_time.map_or(wrote_at, |t| t.max(wrote_at)));
                }
            }
            Err(err) => {
                warn!(session_id, error = %err, "append cursor message failed");
                break;
            }
        }
    }

    if written > 0 {
        if let Err(err) = writer::save_cursor_state(base, &mut cursor) {
            warn!(session_id, error = %err, "cursor state save failed");
        }
        inner.state.record_event(session_id, last_event_time, written);
    }
}
