//! In-memory daemon runtime state: status counters and the session-file
//! registry that pins each `(session_id, tool)` to its on-disk log.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tabs_core::format_rfc3339;

use crate::paths;

pub struct State {
    started_at: DateTime<Utc>,
    sessions: HashSet<String>,
    events_processed: u64,
    last_event_at: Option<DateTime<Utc>>,
    session_files: HashMap<String, PathBuf>,
    cursor_polling: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Status {
    pub pid: u32,
    pub uptime_seconds: i64,
    pub sessions_captured: usize,
    pub events_processed: u64,
    pub cursor_polling: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_event_at: String,
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

impl State {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            sessions: HashSet::new(),
            events_processed: 0,
            last_event_at: None,
            session_files: HashMap::new(),
            cursor_polling: false,
        }
    }

    pub fn record_event(
        &mut self,
        session_id: &str,
        ts: Option<DateTime<Utc>>,
        events_written: u64,
    ) {
        if session_id.is_empty() || events_written == 0 {
            return;
        }
        self.sessions.insert(session_id.to_string());
        self.events_processed += events_written;
        if let Some(ts) = ts {
            if self.last_event_at.map_or(true, |last| ts > last) {
                self.last_event_at = Some(ts);
            }
        }
    }

    pub fn set_cursor_polling(&mut self, polling: bool) {
        self.cursor_polling = polling;
    }

    pub fn snapshot(&self, pid: u32) -> Status {
        Status {
            pid,
            uptime_seconds: (Utc::now() - self.started_at).num_seconds(),
            sessions_captured: self.sessions.len(),
            events_processed: self.events_processed,
            cursor_polling: self.cursor_polling,
            last_event_at: self.last_event_at.map(format_rfc3339).unwrap_or_default(),
        }
    }

    /// Resolve the session file for `(session_id, tool)`, reusing the most
    /// recent existing file with the matching prefix before minting a new
    /// path under today's date directory.
    pub fn ensure_session_file(
        &mut self,
        base: &Path,
        session_id: &str,
        tool: &str,
        event_time: DateTime<Utc>,
    ) -> io::Result<PathBuf> {
        if session_id.is_empty() || tool.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "invalid session or tool",
            ));
        }
        let key = format!("{}|{}", session_id, tool);
        if let Some(path) = self.session_files.get(&key) {
            return Ok(path.clone());
        }
        if let Some(existing) = find_existing_session_file(base, session_id, tool)? {
            self.session_files.insert(key, existing.clone());
            return Ok(existing);
        }

        let date_dir = paths::sessions_dir(base).join(event_time.format("%Y-%m-%d").to_string());
        {
            use std::os::unix::fs::DirBuilderExt;
            fs::DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(&date_dir)?;
        }
        let filename = format!("{}-{}-{}.jsonl", session_id, tool, event_time.timestamp());
        let path = date_dir.join(filename);
        self.session_files.insert(key, path.clone());
        Ok(path)
    }
}

/// Scan every day directory for the newest `<session_id>-<tool>-<unix>.jsonl`
/// file, judged by the embedded unix-seconds suffix.
pub fn find_existing_session_file(
    base: &Path,
    session_id: &str,
    tool: &str,
) -> io::Result<Option<PathBuf>> {
    let prefix = format!("{}-{}-", session_id, tool);
    find_session_file_with_prefix(base, &prefix)
}

pub fn find_session_file_with_prefix(base: &Path, prefix: &str) -> io::Result<Option<PathBuf>> {
    let sessions_dir = paths::sessions_dir(base);
    let entries = match fs::read_dir(&sessions_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };

    let mut best: Option<(i64, PathBuf)> = None;
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        for file in fs::read_dir(entry.path())? {
            let file = file?;
            let name = file.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(ts) = parse_file_timestamp(name, prefix) else {
                continue;
            };
            if best.as_ref().map_or(true, |(best_ts, _)| ts > *best_ts) {
                best = Some((ts, file.path()));
            }
        }
    }
    Ok(best.map(|(_, path)| path))
}

fn parse_file_timestamp(name: &str, prefix: &str) -> Option<i64> {
    let rest = name.strip_prefix(prefix)?.strip_suffix(".jsonl")?;
    // The suffix after the last dash is the unix-seconds stamp; session ids
    // themselves may contain dashes.
    let ts_part = rest.rsplit('-').next()?;
    let trimmed = rest
        .strip_suffix(ts_part)
        .map(|head| head.is_empty() || head.ends_with('-'))
        .unwrap_or(false);
    if !trimmed {
        return None;
    }
    ts_part.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabs_core::{TOOL_CLAUDE_CODE, parse_rfc3339};

    #[test]
    fn ensure_session_file_creates_dated_path() {
        let dir = tempfile::tempdir().expect("temp dir");
        paths::ensure_layout(dir.path()).expect("layout");
        let mut state = State::new();
        let ts = parse_rfc3339("2026-01-05T08:30:00Z").expect("ts");
        let path = state
            .ensure_session_file(dir.path(), "s1", TOOL_CLAUDE_CODE, ts)
            .expect("session file");
        assert!(path.ends_with(format!(
            "sessions/2026-01-05/s1-claude-code-{}.jsonl",
            ts.timestamp()
        )));
    }

    #[test]
    fn ensure_session_file_reuses_existing_latest() {
        let dir = tempfile::tempdir().expect("temp dir");
        paths::ensure_layout(dir.path()).expect("layout");
        let old_dir = paths::sessions_dir(dir.path()).join("2026-01-01");
        fs::create_dir_all(&old_dir).expect("day dir");
        let older = old_dir.join("s1-claude-code-100.jsonl");
        let newer = old_dir.join("s1-claude-code-200.jsonl");
        fs::write(&older, "").expect("older");
        fs::write(&newer, "").expect("newer");

        let mut state = State::new();
        let ts = parse_rfc3339("2026-01-05T08:30:00Z").expect("ts");
        let path = state
            .ensure_session_file(dir.path(), "s1", TOOL_CLAUDE_CODE, ts)
            .expect("session file");
        assert_eq!(path, newer);

        // Second call comes from the in-memory registry.
        let again = state
            .ensure_session_file(dir.path(), "s1", TOOL_CLAUDE_CODE, ts)
            .expect("session file");
        assert_eq!(again, newer);
    }

    #[test]
    fn find_existing_ignores_other_sessions_and_garbage() {
        let dir = tempfile::tempdir().expect("temp dir");
        paths::ensure_layout(dir.path()).expect("layout");
        let day = paths::sessions_dir(dir.path()).join("2026-01-01");
        fs::create_dir_all(&day).expect("day dir");
        fs::write(day.join("s1-cursor-100.jsonl"), "").expect("other tool");
        fs::write(day.join("s1-claude-code-abc.jsonl"), "").expect("bad ts");
        fs::write(day.join("notes.txt"), "").expect("not jsonl");

        let found = find_existing_session_file(dir.path(), "s1", TOOL_CLAUDE_CODE)
            .expect("scan");
        assert!(found.is_none());
    }

    #[test]
    fn record_event_tracks_sessions_and_latest_timestamp() {
        let mut state = State::new();
        let early = parse_rfc3339("2026-01-01T10:00:00Z");
        let late = parse_rfc3339("2026-01-01T11:00:00Z");
        state.record_event("s1", late, 2);
        state.record_event("s1", early, 1);
        state.record_event("", late, 1);
        state.record_event("s2", None, 0);

        let status = state.snapshot(42);
        assert_eq!(status.pid, 42);
        assert_eq!(status.sessions_captured, 1);
        assert_eq!(status.events_processed, 3);
        assert_eq!(status.last_event_at, "2026-01-01T11:00:00Z");
    }
}
