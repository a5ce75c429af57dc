//! Background removal of empty sessions past the retention window.

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{error, info};

use tabs_core::{EVENT_MESSAGE, EVENT_SESSION_END, event_str, event_timestamp, value_to_i64};

use crate::paths;
use crate::server::Daemon;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Remove session files whose effective message count is zero and whose
/// earliest event is older than the retention window. Empty day directories
/// are removed afterwards. Returns how many files were deleted.
pub fn cleanup_empty_sessions(base: &Path, retention_hours: i64) -> io::Result<usize> {
    if retention_hours <= 0 {
        return Ok(0);
    }

    let sessions_dir = paths::sessions_dir(base);
    let cutoff = Utc::now() - chrono::Duration::hours(retention_hours);

    let entries = match fs::read_dir(&sessions_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err),
    };

    let mut deleted = 0;
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let day_dir = entry.path();
        let Ok(files) = fs::read_dir(&day_dir) else {
            continue;
        };

        for file in files.flatten() {
            let path = file.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("jsonl") {
                continue;
            }
            let Ok((is_empty, created_at)) = inspect_session(&path) else {
                continue;
            };
            let old_enough = created_at.map_or(false, |ts| ts < cutoff);
            if is_empty && old_enough && fs::remove_file(&path).is_ok() {
                deleted += 1;
            }
        }

        if let Ok(mut remaining) = fs::read_dir(&day_dir) {
            if remaining.next().is_none() {
                let _ = fs::remove_dir(&day_dir);
            }
        }
    }

    Ok(deleted)
}

/// Single pass over a session file: effective message count (a
/// `session_end` count overrides the tally) and the earliest timestamp.
fn inspect_session(path: &Path) -> io::Result<(bool, Option<DateTime<Utc>>)> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut buf = Vec::new();
    let mut message_count: i64 = 0;
    let mut created_at: Option<DateTime<Utc>> = None;

    loop {
        buf.clear();
        let n = reader.read_until(b'\n', &mut buf)?;
        if n == 0 {
            break;
        }
        let Ok(event) = serde_json::from_slice::<Value>(&buf) else {
            continue;
        };

        if created_at.is_none() {
            created_at = event_timestamp(&event);
        }
        match event_str(&event, "event_type") {
            Some(EVENT_MESSAGE) => message_count += 1,
            Some(EVENT_SESSION_END) => {
                if let Some(count) = event
                    .get("data")
                    .and_then(|data| data.get("message_count"))
                    .and_then(value_to_i64)
                {
                    message_count = count;
                }
            }
            _ => {}
        }
    }

    Ok((message_count == 0, created_at))
}

/// Run cleanup once at startup and then hourly. Disabled when retention is
/// not positive.
pub fn spawn_cleanup(daemon: Arc<Daemon>, retention_hours: i64) {
    if retention_hours <= 0 {
        info!("empty session cleanup disabled");
        return;
    }
    info!(retention_hours, "starting empty session cleanup routine");
    tokio::spawn(async move {
        run_cleanup(daemon.base_dir(), retention_hours);
        let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            run_cleanup(daemon.base_dir(), retention_hours);
        }
    });
}

fn run_cleanup(base: &Path, retention_hours: i64) {
    match cleanup_empty_sessions(base, retention_hours) {
        Ok(deleted) if deleted > 0 => info!(deleted, "cleaned up empty sessions"),
        Ok(_) => {}
        Err(err) => error!(error = %err, "cleanup failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tabs_core::format_rfc3339;

    fn day_dir(base: &Path, day: &str) -> std::path::PathBuf {
        let dir = paths::sessions_dir(base).join(day);
        fs::create_dir_all(&dir).expect("day dir");
        dir
    }

    fn write_session(path: &Path, lines: &[String]) {
        let mut file = File::create(path).expect("create");
        for line in lines {
            writeln!(file, "{}", line).expect("write");
        }
    }

    #[test]
    fn removes_old_empty_sessions_and_day_dirs() {
        let dir = tempfile::tempdir().expect("temp dir");
        paths::ensure_layout(dir.path()).expect("layout");
        let day = day_dir(dir.path(), "2020-01-01");
        let old_ts = format_rfc3339(Utc::now() - chrono::Duration::hours(48));
        write_session(
            &day.join("s1-cursor-100.jsonl"),
            &[format!(
                r#"{{"event_type":"session_start","timestamp":"{}","tool":"cursor","session_id":"s1","data":{{}}}}"#,
                old_ts
            )],
        );

        let deleted = cleanup_empty_sessions(dir.path(), 24).expect("cleanup");
        assert_eq!(deleted, 1);
        assert!(!day.exists());
    }

    #[test]
    fn keeps_sessions_with_messages() {
        let dir = tempfile::tempdir().expect("temp dir");
        paths::ensure_layout(dir.path()).expect("layout");
        let day = day_dir(dir.path(), "2020-01-01");
        let old_ts = format_rfc3339(Utc::now() - chrono::Duration::hours(48));
        let path = day.join("s1-cursor-100.jsonl");
        write_session(
            &path,
            &[format!(
                r#"{{"event_type":"message","timestamp":"{}","tool":"cursor","session_id":"s1","data":{{"role":"user"}}}}"#,
                old_ts
            )],
        );

        let deleted = cleanup_empty_sessions(dir.path(), 24).expect("cleanup");
        assert_eq!(deleted, 0);
        assert!(path.exists());
    }

    #[test]
    fn session_end_count_overrides_tally() {
        let dir = tempfile::tempdir().expect("temp dir");
        paths::ensure_layout(dir.path()).expect("layout");
        let day = day_dir(dir.path(), "2020-01-01");
        let old_ts = format_rfc3339(Utc::now() - chrono::Duration::hours(48));
        let path = day.join("s1-cursor-100.jsonl");
        // The log shows one message but session_end says zero; the override
        // wins and the file is removed.
        write_session(
            &path,
            &[
                format!(
                    r#"{{"event_type":"message","timestamp":"{}","tool":"cursor","session_id":"s1","data":{{"role":"user"}}}}"#,
                    old_ts
                ),
                format!(
                    r#"{{"event_type":"session_end","timestamp":"{}","tool":"cursor","session_id":"s1","data":{{"message_count":0}}}}"#,
                    old_ts
                ),
            ],
        );

        let deleted = cleanup_empty_sessions(dir.path(), 24).expect("cleanup");
        assert_eq!(deleted, 1);
    }

    #[test]
    fn recent_empty_sessions_survive() {
        let dir = tempfile::tempdir().expect("temp dir");
        paths::ensure_layout(dir.path()).expect("layout");
        let day = day_dir(dir.path(), "2026-01-01");
        let fresh_ts = format_rfc3339(Utc::now());
        let path = day.join("s1-cursor-100.jsonl");
        write_session(
            &path,
            &[format!(
                r#"{{"event_type":"session_start","timestamp":"{}","tool":"cursor","session_id":"s1","data":{{}}}}"#,
                fresh_ts
            )],
        );

        let deleted = cleanup_empty_sessions(dir.path(), 24).expect("cleanup");
        assert_eq!(deleted, 0);
        assert!(path.exists());
    }

    #[test]
    fn zero_retention_disables_cleanup() {
        let dir = tempfile::tempdir().expect("temp dir");
        assert_eq!(cleanup_empty_sessions(dir.path(), 0).expect("cleanup"), 0);
    }
}
