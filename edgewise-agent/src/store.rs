//! SQLite-backed durable storage.
//!
//! Two tables: one row per state kind holding the full serialized target
//! state plus its content hash (writes are full-replace, delete-then-insert,
//! and skipped entirely when the hash is unchanged), and one row per queued
//! item ordered by creation time for FIFO replay. WAL mode for crash
//! recovery.

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio_rusqlite::Connection;
use tracing::debug;

use edgewise_core::model::TargetState;

const TARGET_KIND: &str = "target";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("corrupt stored data: {0}")]
    Corrupt(String),
}

/// Content hash over the canonical JSON serialization.
pub fn content_hash(content: &str) -> String {
    format!("{:x}", Sha256::digest(content.as_bytes()))
}

/// A queue row as stored, payload still serialized.
#[derive(Clone, Debug)]
pub struct StoredQueueItem {
    pub id: i64,
    pub payload: String,
    pub created_at: DateTime<Utc>,
    pub attempts: u32,
}

pub struct Store {
    conn: Connection,
}

impl Store {
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path).await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    /// Ephemeral in-memory database, for tests and dry runs.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        self.conn
            .call(|conn| {
                conn.pragma_update(None, "journal_mode", "WAL")?;
                conn.pragma_update(None, "synchronous", "NORMAL")?;
                conn.pragma_update(None, "busy_timeout", 5000)?;
                conn.execute_batch(
                    "CREATE TABLE IF NOT EXISTS target_state (
                         kind TEXT PRIMARY KEY,
                         content TEXT NOT NULL,
                         hash TEXT NOT NULL,
                         updated_at TEXT NOT NULL
                     );
                     CREATE TABLE IF NOT EXISTS queue_items (
                         id INTEGER PRIMARY KEY AUTOINCREMENT,
                         queue TEXT NOT NULL,
                         payload TEXT NOT NULL,
                         created_at TEXT NOT NULL,
                         attempts INTEGER NOT NULL DEFAULT 0
                     );
                     CREATE INDEX IF NOT EXISTS idx_queue_items_order
                         ON queue_items(queue, created_at, id);",
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Persist the target state. Returns whether a durable write happened:
    /// an unchanged content hash skips the write entirely.
    pub async fn save_target_state(&self, state: &TargetState) -> Result<bool, StoreError> {
        let content = serde_json::to_string(state)?;
        let hash = content_hash(&content);
        let now = Utc::now().to_rfc3339();

        let written = self
            .conn
            .call(move |conn| {
                let existing: Option<String> = conn
                    .query_row(
                        "SELECT hash FROM target_state WHERE kind = ?1",
                        params![TARGET_KIND],
                        |row| row.get(0),
                    )
                    .optional()?;

                if existing.as_deref() == Some(hash.as_str()) {
                    return Ok(false);
                }

                conn.execute(
                    "DELETE FROM target_state WHERE kind = ?1",
                    params![TARGET_KIND],
                )?;
                conn.execute(
                    "INSERT INTO target_state (kind, content, hash, updated_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![TARGET_KIND, content, hash, now],
                )?;
                Ok(true)
            })
            .await?;

        if written {
            debug!("target state persisted");
        } else {
            debug!("target state unchanged, skipping write");
        }
        Ok(written)
    }

    pub async fn load_target_state(&self) -> Result<Option<TargetState>, StoreError> {
        let content: Option<String> = self
            .conn
            .call(|conn| {
                let row = conn
                    .query_row(
                        "SELECT content FROM target_state WHERE kind = ?1",
                        params![TARGET_KIND],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(row)
            })
            .await?;

        match content {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub async fn queue_push(
        &self,
        queue: &str,
        payload: &str,
        created_at: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let queue = queue.to_string();
        let payload = payload.to_string();
        let created = created_at.to_rfc3339();
        let id = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO queue_items (queue, payload, created_at, attempts)
                     VALUES (?1, ?2, ?3, 0)",
                    params![queue, payload, created],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;
        Ok(id)
    }

    pub async fn queue_load(&self, queue: &str) -> Result<Vec<StoredQueueItem>, StoreError> {
        let queue = queue.to_string();
        let rows: Vec<(i64, String, String, u32)> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, payload, created_at, attempts FROM queue_items
                     WHERE queue = ?1 ORDER BY created_at, id",
                )?;
                let rows = stmt
                    .query_map(params![queue], |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        rows.into_iter()
            .map(|(id, payload, created_at, attempts)| {
                let created_at = DateTime::parse_from_rfc3339(&created_at)
                    .map_err(|e| StoreError::Corrupt(format!("bad timestamp on row {id}: {e}")))?
                    .with_timezone(&Utc);
                Ok(StoredQueueItem {
                    id,
                    payload,
                    created_at,
                    attempts,
                })
            })
            .collect()
    }

    pub async fn queue_delete(&self, id: i64) -> Result<(), StoreError> {
        self.conn
            .call(move |conn| {
                conn.execute("DELETE FROM queue_items WHERE id = ?1", params![id])?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn queue_bump_attempts(&self, id: i64) -> Result<(), StoreError> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE queue_items SET attempts = attempts + 1 WHERE id = ?1",
                    params![id],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn queue_len(&self, queue: &str) -> Result<usize, StoreError> {
        let queue = queue.to_string();
        let count: i64 = self
            .conn
            .call(move |conn| {
                let n = conn.query_row(
                    "SELECT COUNT(*) FROM queue_items WHERE queue = ?1",
                    params![queue],
                    |row| row.get(0),
                )?;
                Ok(n)
            })
            .await?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgewise_core::model::{AppConfig, TargetState};

    fn sample_state(app_name: &str) -> TargetState {
        let mut state = TargetState::default();
        state.apps.insert(
            "1".into(),
            AppConfig {
                app_id: 1,
                app_name: app_name.into(),
                ..AppConfig::default()
            },
        );
        state
    }

    #[tokio::test]
    async fn test_identical_saves_write_once() {
        let store = Store::open_in_memory().await.unwrap();
        let state = sample_state("gateway");

        assert!(store.save_target_state(&state).await.unwrap());
        // Byte-identical content (after clone): no second durable write.
        assert!(!store.save_target_state(&state.clone()).await.unwrap());

        let changed = sample_state("gateway-v2");
        assert!(store.save_target_state(&changed).await.unwrap());
    }

    #[tokio::test]
    async fn test_target_state_round_trip() {
        let store = Store::open_in_memory().await.unwrap();
        assert!(store.load_target_state().await.unwrap().is_none());

        let state = sample_state("gateway");
        store.save_target_state(&state).await.unwrap();
        let loaded = store.load_target_state().await.unwrap().unwrap();
        assert_eq!(loaded, state);
    }

    #[tokio::test]
    async fn test_queue_rows_replay_in_fifo_order() {
        let store = Store::open_in_memory().await.unwrap();
        let now = Utc::now();
        store.queue_push("events", "a", now).await.unwrap();
        store.queue_push("events", "b", now).await.unwrap();
        store.queue_push("other", "x", now).await.unwrap();

        let items = store.queue_load("events").await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].payload, "a");
        assert_eq!(items[1].payload, "b");
        assert_eq!(store.queue_len("other").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_queue_attempt_bump_persists() {
        let store = Store::open_in_memory().await.unwrap();
        let id = store.queue_push("events", "a", Utc::now()).await.unwrap();
        store.queue_bump_attempts(id).await.unwrap();
        store.queue_bump_attempts(id).await.unwrap();
        let items = store.queue_load("events").await.unwrap();
        assert_eq!(items[0].attempts, 2);
    }
}
