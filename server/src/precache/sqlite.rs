//! SQLite implementation of the CacheIndex trait

use crate::precache::{CacheIndex, PrecacheError, StoredEntry};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

/// SQLite-backed implementation of CacheIndex
#[derive(Clone)]
pub struct SqliteCacheIndex {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCacheIndex {
    /// Create a new SQLite cache index
    ///
    /// If the database doesn't exist, it will be created with the required schema.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, PrecacheError> {
        let conn = Connection::open(db_path)?;
        let index = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        index.init_schema()?;
        Ok(index)
    }

    #[cfg(test)]
    pub fn in_memory() -> Result<Self, PrecacheError> {
        let index = Self {
            conn: Arc::new(Mutex::new(Connection::open_in_memory()?)),
        };
        index.init_schema()?;
        Ok(index)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, PrecacheError> {
        self.conn
            .lock()
            .map_err(|_| PrecacheError::Storage("cache index lock poisoned".to_string()))
    }

    /// Initialize the database schema
    fn init_schema(&self) -> Result<(), PrecacheError> {
        let conn = self.lock()?;

        // One row per stored response; bodies live in the BodyStore
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS precache_entries (
                cache_name TEXT NOT NULL,
                cache_key TEXT NOT NULL,
                url TEXT NOT NULL,
                revision TEXT,
                content_hash TEXT NOT NULL,
                status INTEGER NOT NULL,
                headers TEXT NOT NULL,
                size INTEGER NOT NULL,
                stored_at TEXT NOT NULL,
                PRIMARY KEY (cache_name, cache_key)
            )
            "#,
            [],
        )?;

        // Index for finding older revisions of a URL
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_precache_entries_url ON precache_entries(cache_name, url)",
            [],
        )?;

        // Index for body reference checks
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_precache_entries_hash ON precache_entries(content_hash)",
            [],
        )?;

        info!("Precache index schema initialized");
        Ok(())
    }

    fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<StoredEntry> {
        let headers: String = row.get(5)?;
        let stored_at: String = row.get(7)?;

        let headers = serde_json::from_str(&headers).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
        })?;
        let stored_at = DateTime::parse_from_rfc3339(&stored_at)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, Box::new(e))
            })?;

        Ok(StoredEntry {
            cache_key: row.get(0)?,
            url: row.get(1)?,
            revision: row.get(2)?,
            content_hash: row.get(3)?,
            status: row.get(4)?,
            headers,
            size: row.get::<_, i64>(6)? as u64,
            stored_at,
        })
    }
}

const ENTRY_COLUMNS: &str = "cache_key, url, revision, content_hash, status, headers, size, stored_at";

#[async_trait::async_trait]
impl CacheIndex for SqliteCacheIndex {
    async fn lookup(&self, cache_name: &str, cache_key: &str) -> Result<Option<StoredEntry>, PrecacheError> {
        let conn = self.lock()?;

        let entry = conn
            .query_row(
                &format!(
                    "SELECT {} FROM precache_entries WHERE cache_name = ?1 AND cache_key = ?2",
                    ENTRY_COLUMNS
                ),
                params![cache_name, cache_key],
                Self::row_to_entry,
            )
            .optional()?;
        Ok(entry)
    }

    async fn insert(&self, cache_name: &str, entry: StoredEntry) -> Result<(), PrecacheError> {
        let conn = self.lock()?;
        let headers = serde_json::to_string(&entry.headers)
            .map_err(|e| PrecacheError::Storage(format!("failed to encode headers: {}", e)))?;

        conn.execute(
            r#"
            INSERT OR REPLACE INTO precache_entries
                (cache_name, cache_key, url, revision, content_hash, status, headers, size, stored_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                cache_name,
                entry.cache_key,
                entry.url,
                entry.revision,
                entry.content_hash,
                entry.status,
                headers,
                entry.size as i64,
                entry.stored_at.to_rfc3339()
            ],
        )?;

        debug!("Indexed {} in {}", entry.cache_key, cache_name);
        Ok(())
    }

    async fn keys(&self, cache_name: &str) -> Result<Vec<String>, PrecacheError> {
        let conn = self.lock()?;

        let mut stmt =
            conn.prepare("SELECT cache_key FROM precache_entries WHERE cache_name = ?1 ORDER BY cache_key")?;
        let keys = stmt
            .query_map(params![cache_name], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    async fn keys_for_url(&self, cache_name: &str, url: &str) -> Result<Vec<String>, PrecacheError> {
        let conn = self.lock()?;

        let mut stmt = conn.prepare(
            "SELECT cache_key FROM precache_entries WHERE cache_name = ?1 AND url = ?2 ORDER BY stored_at",
        )?;
        let keys = stmt
            .query_map(params![cache_name, url], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    async fn remove(&self, cache_name: &str, cache_key: &str) -> Result<Option<StoredEntry>, PrecacheError> {
        let conn = self.lock()?;

        let entry = conn
            .query_row(
                &format!(
                    "SELECT {} FROM precache_entries WHERE cache_name = ?1 AND cache_key = ?2",
                    ENTRY_COLUMNS
                ),
                params![cache_name, cache_key],
                Self::row_to_entry,
            )
            .optional()?;

        if entry.is_some() {
            conn.execute(
                "DELETE FROM precache_entries WHERE cache_name = ?1 AND cache_key = ?2",
                params![cache_name, cache_key],
            )?;
            debug!("Removed {} from {}", cache_key, cache_name);
        }
        Ok(entry)
    }

    async fn is_referenced(&self, content_hash: &str) -> Result<bool, PrecacheError> {
        let conn = self.lock()?;

        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM precache_entries WHERE content_hash = ?1",
            params![content_hash],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}
