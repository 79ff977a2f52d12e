//! Local key-value store
//!
//! Device-local collections (the System A queue and history, the System B
//! pending index, the session) live here as JSON values, one row per key in
//! `kv_store`. A missing key reads as an empty collection. So does a value that
//! no longer deserializes: it is copied to `<key>.corrupt` and the collection
//! starts over rather than taking the sync cycle down with it.

use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};
use sqlx::SqlitePool;
use tokio::sync::Mutex;

use crate::error::Result;

/// Keys used by the engine
pub mod keys {
    pub const QUEUE: &str = "report_queue";
    pub const HISTORY: &str = "report_history";
    pub const FAILED: &str = "report_failed";
    pub const PENDING_SYNC: &str = "pending_sync_ids";
    pub const LOCAL_DRAWING_ENTRIES: &str = "local_drawing_entries";
    pub const ANONYMOUS_ID: &str = "anonymous_user_id";
    pub const SESSION: &str = "auth_session";
    pub const LAST_MIGRATION: &str = "last_identity_migration";
}

#[derive(Clone)]
pub struct LocalStore {
    pool: SqlitePool,
    /// Serializes read-modify-write cycles within this process
    write_lock: Arc<Mutex<()>>,
}

impl LocalStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn read_raw(&self, key: &str) -> Result<Option<String>> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM kv_store WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn write_raw(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO kv_store (key, value, updated_at)
               VALUES (?, ?, ?)
               ON CONFLICT(key) DO UPDATE SET
                 value = excluded.value,
                 updated_at = excluded.updated_at"#,
        )
        .bind(key)
        .bind(value)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Decode a stored value, moving it aside when it is unreadable
    async fn decode<T: DeserializeOwned>(&self, key: &str, raw: Option<String>) -> Option<T> {
        let raw = raw?;
        match serde_json::from_str::<T>(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                log::warn!("Unreadable value under '{}', starting empty: {}", key, e);
                if let Err(e) = self.write_raw(&format!("{}.corrupt", key), &raw).await {
                    log::warn!("Failed to preserve corrupt value for '{}': {}", key, e);
                }
                None
            }
        }
    }

    /// Read a single value, surfacing database errors.
    ///
    /// `Ok(None)` means the key is missing or its value was corrupt; only then
    /// is it safe to write a replacement.
    pub async fn try_get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let raw = self.read_raw(key).await?;
        Ok(self.decode(key, raw).await)
    }

    /// Read a single value; missing or unreadable reads as `None`
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.read_raw(key).await {
            Ok(raw) => self.decode(key, raw).await,
            Err(e) => {
                log::warn!("Failed to read '{}' from local store: {}", key, e);
                None
            }
        }
    }

    /// Read a collection; missing or unreadable reads as empty
    pub async fn list<T: DeserializeOwned>(&self, key: &str) -> Vec<T> {
        self.get::<Vec<T>>(key).await.unwrap_or_default()
    }

    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let json = serde_json::to_string(value)?;
        let _guard = self.write_lock.lock().await;
        self.write_raw(key, &json).await
    }

    pub async fn remove(&self, key: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        sqlx::query("DELETE FROM kv_store WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Read-modify-write a collection as one unit.
    ///
    /// A database error while reading aborts without writing, so a transient
    /// failure can never be mistaken for an empty collection and wipe it.
    pub async fn update_list<T, R, F>(&self, key: &str, f: F) -> Result<R>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut Vec<T>) -> R,
    {
        let _guard = self.write_lock.lock().await;
        let raw = self.read_raw(key).await?;
        let mut items: Vec<T> = self.decode(key, raw).await.unwrap_or_default();
        let result = f(&mut items);
        let json = serde_json::to_string(&items)?;
        self.write_raw(key, &json).await?;
        Ok(result)
    }
}
