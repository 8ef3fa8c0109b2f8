//! SQLite-backed token store

use super::TokenStore;
use crate::Result;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

/// Durable [`TokenStore`] in a single WAL-mode SQLite file
pub struct SqliteTokenStore {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl SqliteTokenStore {
    /// Open or create the database, creating parent directories as needed
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        tracing::info!(path = %path.display(), "Opening state database");

        let conn = Connection::open(&path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;

        let store = Self {
            conn: Mutex::new(conn),
            path,
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn init_schema(&self) -> Result<()> {
        self.conn
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS properties (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL,
                    updated_at INTEGER NOT NULL
                );
                "#,
            )?;
        Ok(())
    }
}

impl TokenStore for SqliteTokenStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let value = conn
            .query_row(
                "SELECT value FROM properties WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.execute(
            "INSERT INTO properties (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, now],
        )?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.execute("DELETE FROM properties WHERE key = ?1", params![key])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_values_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("state.db");

        {
            let store = SqliteTokenStore::open(&path).unwrap();
            store.set("sync/a/b/sync_token", "tok-1").unwrap();
            store.set("sync/a/b/sync_token", "tok-2").unwrap();
            store.set("sync/a/b/page_token", "page-1").unwrap();
            store.delete("sync/a/b/page_token").unwrap();
        }

        let store = SqliteTokenStore::open(&path).unwrap();
        assert_eq!(
            store.get("sync/a/b/sync_token").unwrap().as_deref(),
            Some("tok-2")
        );
        assert_eq!(store.get("sync/a/b/page_token").unwrap(), None);
        assert_eq!(store.path(), path.as_path());
    }

    #[test]
    fn test_delete_missing_key_is_ok() {
        let dir = TempDir::new().unwrap();
        let store = SqliteTokenStore::open(dir.path().join("state.db")).unwrap();
        assert!(store.delete("never-set").is_ok());
    }
}
