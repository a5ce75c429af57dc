//! API key lifecycle. The plaintext is returned exactly once at creation;
//! only the SHA-256 hash and a short display prefix are stored.

use rand::RngCore;
use rusqlite::params;
use serde::Serialize;
use uuid::Uuid;

use crate::db::Db;
use crate::errors::{ApiError, Result};
use crate::ingest::{API_KEY_PREFIX, hash_api_key};

const KEY_PREFIX_DISPLAY_LEN: usize = 13;

#[derive(Debug, Serialize)]
pub struct ApiKeySummary {
    pub id: String,
    pub key_prefix: String,
    pub name: String,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<String>,
    pub is_active: bool,
    pub usage_count: i64,
}

#[derive(Debug)]
pub struct CreatedKey {
    pub id: String,
    pub key: String,
    pub key_prefix: String,
    pub created_at: String,
}

/// `tabs_` + 32 hex chars from 16 random bytes, plus its hash and display
/// prefix.
pub fn generate_api_key() -> (String, String, String) {
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    let suffix: String = bytes.iter().map(|byte| format!("{:02x}", byte)).collect();
    let key = format!("{}{}", API_KEY_PREFIX, suffix);
    let hash = hash_api_key(&key);
    let prefix: String = key.chars().take(KEY_PREFIX_DISPLAY_LEN).collect();
    (key, hash, prefix)
}

impl Db {
    pub fn create_api_key(&self, user_id: &str, name: &str) -> Result<CreatedKey> {
        let (key, hash, prefix) = generate_api_key();
        let id = Uuid::new_v4().to_string();
        self.conn.execute(
            "INSERT INTO api_keys (id, key_hash, key_prefix, user_id, name)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, hash, prefix, user_id, name],
        )?;
        let created_at: String = self.conn.query_row(
            "SELECT created_at FROM api_keys WHERE id = ?1",
            [&id],
            |row| row.get(0),
        )?;
        Ok(CreatedKey {
            id,
            key,
            key_prefix: prefix,
            created_at,
        })
    }

    pub fn list_api_keys(&self, user_id: &str) -> Result<Vec<ApiKeySummary>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, key_prefix, name, created_at, last_used_at, is_active, usage_count
             FROM api_keys WHERE user_id = ?1 ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map([user_id], |row| {
            Ok(ApiKeySummary {
                id: row.get(0)?,
                key_prefix: row.get(1)?,
                name: row.get(2)?,
                created_at: row.get(3)?,
                last_used_at: row.get(4)?,
                is_active: row.get(5)?,
                usage_count: row.get(6)?,
            })
        })?;
        let mut keys = Vec::new();
        for key in rows {
            keys.push(key?);
        }
        Ok(keys)
    }

    /// Soft-delete a key by flipping `is_active`.
    pub fn revoke_api_key(&self, id: &str, user_id: &str) -> Result<()> {
        let updated = self.conn.execute(
            "UPDATE api_keys SET is_active = 0 WHERE id = ?1 AND user_id = ?2",
            params![id, user_id],
        )?;
        if updated == 0 {
            return Err(ApiError::not_found("not_found", "API key not found"));
        }
        Ok(())
    }
}
