//! SQLite storage for the remote server. Handlers open a connection per
//! request; migrations are embedded and applied in order.

use std::path::Path;

use rusqlite::Connection;

use crate::errors::{ApiError, Result};

pub const MIGRATION_0001: &str = include_str!("../migrations/0001_init.sql");

pub const MIGRATIONS: &[(i64, &str)] = &[(1, MIGRATION_0001)];

pub struct Db {
    pub(crate) conn: Connection,
}

impl Db {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "busy_timeout", 5_000)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self { conn })
    }

    pub fn migrate(&mut self) -> Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            )",
        )?;

        let tx = self.conn.transaction()?;
        for (version, sql) in MIGRATIONS {
            let applied: bool = tx
                .prepare("SELECT 1 FROM schema_migrations WHERE version = ?1")?
                .exists([version])?;
            if applied {
                continue;
            }
            tx.execute_batch(sql)?;
            tx.execute(
                "INSERT INTO schema_migrations (version) VALUES (?1)",
                [version],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Liveness probe for /healthz.
    pub fn ping(&self) -> Result<()> {
        self.conn
            .query_row("SELECT 1", [], |_| Ok(()))
            .map_err(ApiError::from)
    }
}

/// True when an insert failed on a uniqueness constraint (the racing-upload
/// case for `UNIQUE(tool, session_id)`).
pub fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrate_is_idempotent() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("server.sqlite");
        let mut db = Db::open(&path).expect("open");
        db.migrate().expect("migrate once");
        db.migrate().expect("migrate twice");

        let count: i64 = db
            .conn
            .query_row("SELECT COUNT(*) FROM schema_migrations", [], |row| {
                row.get(0)
            })
            .expect("count");
        assert_eq!(count, MIGRATIONS.len() as i64);
        db.ping().expect("ping");
    }

    #[test]
    fn unique_tool_session_is_enforced() {
        let dir = tempfile::tempdir().expect("temp dir");
        let mut db = Db::open(dir.path().join("server.sqlite")).expect("open");
        db.migrate().expect("migrate");

        let insert = "INSERT INTO sessions (id, tool, session_id, created_at, cwd)
                      VALUES (?1, 'claude-code', 'S1', '2026-01-01T00:00:00Z', '/work')";
        db.conn.execute(insert, ["a"]).expect("first insert");
        let err = db.conn.execute(insert, ["b"]).expect_err("duplicate");
        assert!(is_unique_violation(&err));
    }
}
