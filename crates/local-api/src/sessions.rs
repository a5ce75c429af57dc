//! Read-only indexer over the on-disk session logs. One pass per file
//! derives the summary; filters apply on top.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::Serialize;
use serde_json::Value;
use walkdir::WalkDir;

use tabs_core::{
    EVENT_MESSAGE, EVENT_SESSION_END, EVENT_SESSION_START, EVENT_TOOL_USE, contains_query,
    event_str, event_timestamp, extract_text, format_rfc3339, trim_summary, value_to_i64,
};
use tabs_daemon::paths;
use tabs_daemon::state::find_session_file_with_prefix;

const SUMMARY_LIMIT: usize = 160;

#[derive(Debug, Default, Clone)]
pub struct SessionFilter {
    pub tool: String,
    pub date: String,
    pub cwd: String,
    pub q: String,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub tool: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub created_at: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub ended_at: String,
    pub duration_seconds: i64,
    pub message_count: i64,
    pub tool_use_count: i64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub cwd: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub summary: String,
    pub file_path: String,
}

#[derive(Debug, Default, Serialize)]
pub struct SessionDetail {
    pub session_id: String,
    pub tool: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub created_at: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub ended_at: String,
    pub duration_seconds: i64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub cwd: String,
    pub events: Vec<Value>,
}

pub fn list_sessions(base: &Path, filter: &SessionFilter) -> io::Result<Vec<SessionSummary>> {
    let sessions_dir = paths::sessions_dir(base);
    if !sessions_dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut files: Vec<(String, PathBuf)> = Vec::new();
    for entry in WalkDir::new(&sessions_dir).min_depth(2).max_depth(2) {
        let entry = entry.map_err(io::Error::other)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("jsonl") {
            continue;
        }
        let day = entry
            .path()
            .parent()
            .and_then(Path::file_name)
            .and_then(|name| name.to_str())
            .unwrap_or_default()
            .to_string();
        files.push((day, path.to_path_buf()));
    }

    let summarized: Vec<io::Result<(String, SessionSummary, bool)>> = files
        .into_par_iter()
        .map(|(day, path)| {
            summarize_session(&path, filter).map(|(summary, matched)| (day, summary, matched))
        })
        .collect();

    let mut summaries = Vec::new();
    for result in summarized {
        let (day, summary, matched_query) = result?;
        if !matched_query {
            continue;
        }
        if !filter.date.is_empty() {
            match summary.created_at.as_str() {
                "" => {
                    if day != filter.date {
                        continue;
                    }
                }
                created_at => {
                    let created_day = tabs_core::parse_rfc3339(created_at)
                        .map(|ts| ts.format("%Y-%m-%d").to_string())
                        .unwrap_or_default();
                    if created_day != filter.date {
                        continue;
                    }
                }
            }
        }
        if !filter.tool.is_empty() && summary.tool != filter.tool {
            continue;
        }
        if !filter.cwd.is_empty() && !summary.cwd.starts_with(&filter.cwd) {
            continue;
        }
        summaries.push(summary);
    }

    summaries.sort_by(|a, b| sort_time(b).cmp(&sort_time(a)));
    Ok(summaries)
}

fn sort_time(summary: &SessionSummary) -> Option<DateTime<Utc>> {
    tabs_core::parse_rfc3339(&summary.created_at)
        .or_else(|| tabs_core::parse_rfc3339(&summary.ended_at))
}

/// Find the most recent file for a session id regardless of tool.
pub fn find_session_file(base: &Path, session_id: &str) -> io::Result<Option<PathBuf>> {
    find_session_file_with_prefix(base, &format!("{}-", session_id))
}

pub fn get_session(base: &Path, session_id: &str) -> io::Result<Option<SessionDetail>> {
    let Some(path) = find_session_file(base, session_id)? else {
        return Ok(None);
    };
    load_session_detail(&path).map(Some)
}

fn summarize_session(
    path: &Path,
    filter: &SessionFilter,
) -> io::Result<(SessionSummary, bool)> {
    let mut summary = SessionSummary {
        file_path: path.to_string_lossy().to_string(),
        ..SessionSummary::default()
    };
    let query = filter.q.to_lowercase();
    let mut matched_query = query.is_empty();
    let mut earliest: Option<DateTime<Utc>> = None;
    let mut latest: Option<DateTime<Utc>> = None;
    let mut has_start = false;
    let mut override_counts = false;
    let mut first_user_text = String::new();

    for_each_event(path, |event| {
        if summary.session_id.is_empty() {
            if let Some(session_id) = event_str(&event, "session_id") {
                summary.session_id = session_id.to_string();
            }
        }
        if summary.tool.is_empty() {
            if let Some(tool) = event_str(&event, "tool") {
                summary.tool = tool.to_string();
            }
        }

        let ts = event_timestamp(&event);
        if let Some(ts) = ts {
            if earliest.map_or(true, |e| ts < e) {
                earliest = Some(ts);
            }
            if latest.map_or(true, |l| ts > l) {
                latest = Some(ts);
            }
        }

        let data = event.get("data");
        match event_str(&event, "event_type") {
            Some(EVENT_SESSION_START) => {
                if let (Some(ts), false) = (ts, has_start) {
                    summary.created_at = format_rfc3339(ts);
                    has_start = true;
                }
                if let Some(cwd) = data.and_then(|d| d.get("cwd")).and_then(Value::as_str) {
                    if !cwd.is_empty() {
                        summary.cwd = cwd.to_string();
                    }
                }
            }
            Some(EVENT_SESSION_END) => {
                if let Some(ts) = ts {
                    summary.ended_at = format_rfc3339(ts);
                }
                if let Some(data) = data {
                    if let Some(value) = data.get("duration_seconds").and_then(value_to_i64) {
                        summary.duration_seconds = value;
                    }
                    if let Some(value) = data.get("message_count").and_then(value_to_i64) {
                        summary.message_count = value;
                        override_counts = true;
                    }
                    if let Some(value) = data.get("tool_use_count").and_then(value_to_i64) {
                        summary.tool_use_count = value;
                        override_counts = true;
                    }
                }
            }
            Some(EVENT_MESSAGE) => {
                if !override_counts {
                    summary.message_count += 1;
                }
                if first_user_text.is_empty() {
                    if let Some(data) = data {
                        if data.get("role").and_then(Value::as_str) == Some("user") {
                            let text = data
                                .get("content")
                                .map(extract_text)
                                .filter(|text| !text.is_empty())
                                .or_else(|| {
                                    data.get("text").map(extract_text).filter(|t| !t.is_empty())
                                });
                            if let Some(text) = text {
                                first_user_text = text;
                            }
                        }
                    }
                }
            }
            Some(EVENT_TOOL_USE) => {
                if !override_counts {
                    summary.tool_use_count += 1;
                }
            }
            _ => {}
        }

        if !matched_query {
            if summary.tool.to_lowercase().contains(&query) {
                matched_query = true;
            } else if let Some(data) = data {
                if contains_query(data, &query) {
                    matched_query = true;
                }
            }
        }
    })?;

    backfill_times(
        &mut summary.created_at,
        &mut summary.ended_at,
        &mut summary.duration_seconds,
        earliest,
        latest,
    );
    summary.summary = trim_summary(&first_user_text, SUMMARY_LIMIT);

    Ok((summary, matched_query))
}

fn load_session_detail(path: &Path) -> io::Result<SessionDetail> {
    let mut detail = SessionDetail::default();
    let mut earliest: Option<DateTime<Utc>> = None;
    let mut latest: Option<DateTime<Utc>> = None;

    for_each_event(path, |event| {
        if detail.session_id.is_empty() {
            if let Some(session_id) = event_str(&event, "session_id") {
                detail.session_id = session_id.to_string();
            }
        }
        if detail.tool.is_empty() {
            if let Some(tool) = event_str(&event, "tool") {
                detail.tool = tool.to_string();
            }
        }

        let ts = event_timestamp(&event);
        if let Some(ts) = ts {
            if earliest.map_or(true, |e| ts < e) {
                earliest = Some(ts);
            }
            if latest.map_or(true, |l| ts > l) {
                latest = Some(ts);
            }
        }

        match event_str(&event, "event_type") {
            Some(EVENT_SESSION_START) => {
                if let Some(cwd) = event
                    .get("data")
                    .and_then(|d| d.get("cwd"))
                    .and_then(Value::as_str)
                {
                    if !cwd.is_empty() {
                        detail.cwd = cwd.to_string();
                    }
                }
                if let Some(ts) = ts {
                    detail.created_at = format_rfc3339(ts);
                }
            }
            Some(EVENT_SESSION_END) => {
                if let Some(ts) = ts {
                    detail.ended_at = format_rfc3339(ts);
                }
                if let Some(value) = event
                    .get("data")
                    .and_then(|d| d.get("duration_seconds"))
                    .and_then(value_to_i64)
                {
                    detail.duration_seconds = value;
                }
            }
            _ => {}
        }

        detail.events.push(event);
    })?;

    backfill_times(
        &mut detail.created_at,
        &mut detail.ended_at,
        &mut detail.duration_seconds,
        earliest,
        latest,
    );
    Ok(detail)
}

fn backfill_times(
    created_at: &mut String,
    ended_at: &mut String,
    duration_seconds: &mut i64,
    earliest: Option<DateTime<Utc>>,
    latest: Option<DateTime<Utc>>,
) {
    if created_at.is_empty() {
        if let Some(earliest) = earliest {
            *created_at = format_rfc3339(earliest);
        }
    }
    if ended_at.is_empty() {
        if let Some(latest) = latest {
            *ended_at = format_rfc3339(latest);
        }
    }
    if *duration_seconds == 0 {
        if let (Some(earliest), Some(latest)) = (earliest, latest) {
            // Clamp: timestamps are non-decreasing in practice, not enforced.
            *duration_seconds = (latest - earliest).num_seconds().max(0);
        }
    }
}

/// Iterate complete, parseable event lines in a session file. A partial
/// trailing line (crash mid-append) and malformed lines are skipped.
fn for_each_event(path: &Path, mut f: impl FnMut(Value)) -> io::Result<()> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let n = reader.read_until(b'\n', &mut buf)?;
        if n == 0 {
            break;
        }
        if buf.last() != Some(&b'\n') {
            break;
        }
        if buf.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        if let Ok(event) = serde_json::from_slice::<Value>(&buf) {
            f(event);
        }
    }
    Ok(())
}
