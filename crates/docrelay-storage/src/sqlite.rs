//! SQLite update log backend

use async_trait::async_trait;
use docrelay_core::{DocName, StoreError, StoreStats, UpdateStore};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::path::Path;

/// SQLite-backed update log
///
/// Embedded persistence suitable for single-node deployments. Updates are
/// appended as rows and replayed in insertion order on hydration.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a database file at the given path
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn =
            Connection::open(path).map_err(|e| StoreError::Database(e.to_string()))?;

        let store = Self {
            conn: Mutex::new(conn),
        };

        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory database (for testing)
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn =
            Connection::open_in_memory().map_err(|e| StoreError::Database(e.to_string()))?;

        let store = Self {
            conn: Mutex::new(conn),
        };

        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS updates (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                doc TEXT NOT NULL,
                data BLOB NOT NULL,
                created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now') * 1000)
            );

            CREATE INDEX IF NOT EXISTS idx_updates_doc ON updates(doc);
            "#,
        )
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(())
    }
}

#[async_trait]
impl UpdateStore for SqliteStore {
    async fn load(&self, doc: &DocName) -> Result<Vec<Vec<u8>>, StoreError> {
        let conn = self.conn.lock();

        let mut stmt = conn
            .prepare("SELECT data FROM updates WHERE doc = ?1 ORDER BY id")
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let updates = stmt
            .query_map(params![doc.as_str()], |row| row.get::<_, Vec<u8>>(0))
            .map_err(|e| StoreError::Database(e.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(updates)
    }

    async fn append(&self, doc: &DocName, update: &[u8]) -> Result<(), StoreError> {
        let conn = self.conn.lock();

        conn.execute(
            "INSERT INTO updates (doc, data) VALUES (?1, ?2)",
            params![doc.as_str(), update],
        )
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(())
    }

    async fn compact(&self, doc: &DocName) -> Result<usize, StoreError> {
        // The connection lock spans the whole select/delete/insert, so an
        // append can never slip between the read and the rewrite.
        let mut conn = self.conn.lock();

        let tx = conn
            .transaction()
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let rows = {
            let mut stmt = tx
                .prepare("SELECT data FROM updates WHERE doc = ?1 ORDER BY id")
                .map_err(|e| StoreError::Database(e.to_string()))?;
            let collected = stmt
                .query_map(params![doc.as_str()], |row| row.get::<_, Vec<u8>>(0))
                .map_err(|e| StoreError::Database(e.to_string()))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| StoreError::Database(e.to_string()))?;
            collected
        };

        if rows.len() <= 1 {
            return Ok(0);
        }

        let merged = crate::merge_log(&rows)?;

        let removed = tx
            .execute("DELETE FROM updates WHERE doc = ?1", params![doc.as_str()])
            .map_err(|e| StoreError::Database(e.to_string()))?;

        tx.execute(
            "INSERT INTO updates (doc, data) VALUES (?1, ?2)",
            params![doc.as_str(), merged],
        )
        .map_err(|e| StoreError::Database(e.to_string()))?;

        tx.commit().map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(removed - 1)
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let conn = self.conn.lock();

        let (document_count, update_count, total_size): (usize, usize, usize) = conn
            .query_row(
                "SELECT COUNT(DISTINCT doc), COUNT(*), COALESCE(SUM(LENGTH(data)), 0) FROM updates",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(StoreStats {
            document_count,
            update_count,
            total_size_bytes: total_size,
        })
    }
}
