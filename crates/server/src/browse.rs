//! Query side: paginated session list with filters, detail view, and the
//! tag histogram.

use rusqlite::OptionalExtension;
use rusqlite::types::Value as SqlValue;
use serde_json::Value;

use tabs_core::{Tag, extract_text, trim_summary};

use crate::db::Db;
use crate::errors::{ApiError, Result};
use crate::types::{
    MessageDetail, SessionDetail, SessionFilter, SessionSummary, TagCount, ToolDetail,
};

pub const DEFAULT_PAGE_LIMIT: i64 = 20;
pub const MAX_PAGE_LIMIT: i64 = 100;
const SUMMARY_LIMIT: usize = 140;

struct WhereClause {
    sql: String,
    params: Vec<SqlValue>,
}

fn build_session_where(filter: &SessionFilter) -> WhereClause {
    let mut clauses = vec!["1=1".to_string()];
    let mut params: Vec<SqlValue> = Vec::new();

    if !filter.tool.trim().is_empty() {
        params.push(SqlValue::from(filter.tool.trim().to_string()));
        clauses.push(format!("s.tool = ?{}", params.len()));
    }
    if !filter.uploaded_by.trim().is_empty() {
        params.push(SqlValue::from(filter.uploaded_by.trim().to_string()));
        clauses.push(format!("s.uploaded_by = ?{}", params.len()));
    }
    if !filter.query.trim().is_empty() {
        params.push(SqlValue::from(format!("%{}%", filter.query.trim())));
        let idx = params.len();
        clauses.push(format!(
            "(s.cwd LIKE ?{idx}
              OR EXISTS (SELECT 1 FROM messages m
                         WHERE m.session_id = s.id AND m.content LIKE ?{idx})
              OR EXISTS (SELECT 1 FROM tools tl
                         WHERE tl.session_id = s.id AND (
                             tl.tool_name LIKE ?{idx}
                             OR tl.input LIKE ?{idx}
                             OR tl.output LIKE ?{idx}))
              OR EXISTS (SELECT 1 FROM tags tg
                         WHERE tg.session_id = s.id AND (
                             tg.tag_key LIKE ?{idx}
                             OR tg.tag_value LIKE ?{idx})))"
        ));
    }
    for tag in &filter.tags {
        params.push(SqlValue::from(tag.key.clone()));
        let key_idx = params.len();
        params.push(SqlValue::from(tag.value.clone()));
        let value_idx = params.len();
        clauses.push(format!(
            "EXISTS (SELECT 1 FROM tags t
                     WHERE t.session_id = s.id
                       AND t.tag_key = ?{key_idx} AND t.tag_value = ?{value_idx})"
        ));
    }

    WhereClause {
        sql: format!("WHERE {}", clauses.join(" AND ")),
        params,
    }
}

impl Db {
    pub fn list_sessions(
        &self,
        filter: &SessionFilter,
    ) -> Result<(Vec<SessionSummary>, i64)> {
        let where_clause = build_session_where(filter);

        let order_field = match filter.sort.trim() {
            "uploaded_at" => "s.uploaded_at",
            _ => "s.created_at",
        };
        let order_dir = if filter.order.eq_ignore_ascii_case("asc") {
            "ASC"
        } else {
            "DESC"
        };
        let limit = if filter.limit > 0 {
            filter.limit.min(MAX_PAGE_LIMIT)
        } else {
            DEFAULT_PAGE_LIMIT
        };
        let page = filter.page.max(1);
        let offset = (page - 1) * limit;

        let query = format!(
            "SELECT s.id, s.tool, s.session_id, s.created_at, s.ended_at, s.cwd,
                    s.uploaded_by, s.uploaded_at, s.duration_seconds,
                    s.message_count, s.tool_use_count,
                    (SELECT m.content FROM messages m
                     WHERE m.session_id = s.id AND m.role = 'user'
                     ORDER BY m.seq ASC LIMIT 1) AS first_content
             FROM sessions s
             {}
             ORDER BY {} {}
             LIMIT ?{} OFFSET ?{}",
            where_clause.sql,
            order_field,
            order_dir,
            where_clause.params.len() + 1,
            where_clause.params.len() + 2,
        );

        let mut params = where_clause.params.clone();
        params.push(SqlValue::from(limit));
        params.push(SqlValue::from(offset));

        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params), |row| {
            Ok(SessionSummary {
                id: row.get(0)?,
                tool: row.get(1)?,
                session_id: row.get(2)?,
                created_at: row.get(3)?,
                ended_at: row.get(4)?,
                cwd: row.get(5)?,
                uploaded_by: row.get(6)?,
                uploaded_at: row.get(7)?,
                duration_seconds: row.get(8)?,
                message_count: row.get(9)?,
                tool_use_count: row.get(10)?,
                summary: summarize_content(row.get::<_, Option<String>>(11)?.as_deref()),
                tags: Vec::new(),
            })
        })?;

        let mut sessions = Vec::new();
        for row in rows {
            let mut summary = row?;
            summary.tags = self.session_tags(&summary.id)?;
            sessions.push(summary);
        }

        let count_query = format!("SELECT COUNT(*) FROM sessions s {}", where_clause.sql);
        let total: i64 = self.conn.query_row(
            &count_query,
            rusqlite::params_from_iter(where_clause.params),
            |row| row.get(0),
        )?;

        Ok((sessions, total))
    }

    pub fn get_session(&self, id: &str) -> Result<SessionDetail> {
        let summary = self
            .conn
            .prepare(
                "SELECT id, tool, session_id, created_at, ended_at, cwd, uploaded_by,
                        uploaded_at, duration_seconds, message_count, tool_use_count
                 FROM sessions WHERE id = ?1",
            )?
            .query_row([id], |row| {
                Ok(SessionSummary {
                    id: row.get(0)?,
                    tool: row.get(1)?,
                    session_id: row.get(2)?,
                    created_at: row.get(3)?,
                    ended_at: row.get(4)?,
                    cwd: row.get(5)?,
                    uploaded_by: row.get(6)?,
                    uploaded_at: row.get(7)?,
                    duration_seconds: row.get(8)?,
                    message_count: row.get(9)?,
                    tool_use_count: row.get(10)?,
                    summary: String::new(),
                    tags: Vec::new(),
                })
            })
            .optional()?;

        let Some(mut summary) = summary else {
            return Err(ApiError::not_found("session_not_found", "Session not found"));
        };
        summary.tags = self.session_tags(id)?;

        let messages = self.session_messages(id)?;
        let tools = self.session_tools(id)?;
        Ok(SessionDetail {
            summary,
            messages,
            tools,
        })
    }

    fn session_tags(&self, session_id: &str) -> Result<Vec<Tag>> {
        let mut stmt = self.conn.prepare(
            "SELECT tag_key, tag_value FROM tags
             WHERE session_id = ?1 ORDER BY tag_key, tag_value",
        )?;
        let rows = stmt.query_map([session_id], |row| {
            Ok(Tag::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut tags = Vec::new();
        for tag in rows {
            tags.push(tag?);
        }
        Ok(tags)
    }

    fn session_messages(&self, session_id: &str) -> Result<Vec<MessageDetail>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, timestamp, seq, role, model, content FROM messages
             WHERE session_id = ?1 ORDER BY seq",
        )?;
        let rows = stmt.query_map([session_id], |row| {
            Ok(MessageDetail {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                seq: row.get(2)?,
                role: row.get(3)?,
                model: row.get(4)?,
                content: parse_json_column(row.get::<_, String>(5)?),
            })
        })?;
        let mut messages = Vec::new();
        for message in rows {
            messages.push(message?);
        }
        Ok(messages)
    }

    fn session_tools(&self, session_id: &str) -> Result<Vec<ToolDetail>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, timestamp, tool_use_id, tool_name, input, output, is_error
             FROM tools WHERE session_id = ?1 ORDER BY timestamp",
        )?;
        let rows = stmt.query_map([session_id], |row| {
            Ok(ToolDetail {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                tool_use_id: row.get(2)?,
                tool_name: row.get(3)?,
                input: row
                    .get::<_, Option<String>>(4)?
                    .map(parse_json_column)
                    .unwrap_or(Value::Null),
                output: row.get::<_, Option<String>>(5)?.map(parse_json_column),
                is_error: row.get(6)?,
            })
        })?;
        let mut tools = Vec::new();
        for tool in rows {
            tools.push(tool?);
        }
        Ok(tools)
    }

    pub fn list_tags(&self, key: &str, limit: i64) -> Result<Vec<TagCount>> {
        let limit = if limit > 0 { limit } else { 100 };
        let (query, params): (&str, Vec<SqlValue>) = if key.trim().is_empty() {
            (
                "SELECT tag_key, tag_value, COUNT(*) AS count FROM tags
                 GROUP BY tag_key, tag_value ORDER BY count DESC LIMIT ?1",
                vec![SqlValue::from(limit)],
            )
        } else {
            (
                "SELECT tag_key, tag_value, COUNT(*) AS count FROM tags
                 WHERE tag_key = ?1
                 GROUP BY tag_key, tag_value ORDER BY count DESC LIMIT ?2",
                vec![SqlValue::from(key.trim().to_string()), SqlValue::from(limit)],
            )
        };
        let mut stmt = self.conn.prepare(query)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params), |row| {
            Ok(TagCount {
                key: row.get(0)?,
                value: row.get(1)?,
                count: row.get(2)?,
            })
        })?;
        let mut tags = Vec::new();
        for tag in rows {
            tags.push(tag?);
        }
        Ok(tags)
    }
}

fn parse_json_column(raw: String) -> Value {
    serde_json::from_str(&raw).unwrap_or(Value::String(raw))
}

/// First non-empty text from the first user message, trimmed for the list
/// view.
fn summarize_content(raw: Option<&str>) -> String {
    let Some(raw) = raw else {
        return String::new();
    };
    let Ok(content) = serde_json::from_str::<Value>(raw) else {
        return trim_summary(raw, SUMMARY_LIMIT);
    };
    let text = extract_text(&content);
    if text.is_empty() {
        return String::new();
    }
    trim_summary(&text, SUMMARY_LIMIT)
}

pub fn normalize_tag_filter(raw: &str) -> Option<Tag> {
    tabs_core::parse_tag_string(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summarize_content_reads_part_arrays_and_strings() {
        let parts = r#"[{"type":"text","text":"fix the bug"}]"#;
        assert_eq!(summarize_content(Some(parts)), "fix the bug");
        assert_eq!(summarize_content(Some(r#""plain string""#)), "plain string");
        assert_eq!(summarize_content(None), "");
    }

    #[test]
    fn summarize_content_trims_to_140() {
        let long = format!(r#"[{{"type":"text","text":"{}"}}]"#, "y".repeat(200));
        let summary = summarize_content(Some(&long));
        assert!(summary.ends_with("..."));
        assert_eq!(summary.chars().count(), 143);
    }
}
