use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{anyhow, Result};

/// Durable string blob storage keyed by name.
///
/// Implementations must be safe to call from the scheduling task; calls are
/// short and synchronous.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;
}

/// Process-local store. Nothing survives a restart unless the same
/// instance is reused.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let data = self.data.lock().map_err(|e| anyhow!("{}", e))?;
        Ok(data.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut data = self.data.lock().map_err(|e| anyhow!("{}", e))?;
        data.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut data = self.data.lock().map_err(|e| anyhow!("{}", e))?;
        data.remove(key);
        Ok(())
    }
}

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

#[cfg(feature = "sqlite")]
mod sqlite {
    use std::path::Path;
    use std::sync::Mutex;

    use anyhow::{anyhow, Context, Result};
    use rusqlite::{params, Connection, OptionalExtension};

    use super::KeyValueStore;

    const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_store (
    key         TEXT PRIMARY KEY,
    value       TEXT NOT NULL,
    updated_at  DATETIME DEFAULT CURRENT_TIMESTAMP
);
"#;

    /// SQLite-backed [`KeyValueStore`].
    pub struct SqliteStore {
        conn: Mutex<Connection>,
    }

    impl SqliteStore {
        /// Open (or create) the store. Pass `None` for an in-memory database.
        pub fn open(path: Option<&Path>) -> Result<Self> {
            let conn = match path {
                Some(p) => Connection::open(p).context("Failed to open store database")?,
                None => Connection::open_in_memory().context("Failed to open in-memory database")?,
            };

            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA busy_timeout = 5000;",
            )
            .context("Failed to set PRAGMA options")?;

            conn.execute_batch(SCHEMA)
                .context("Failed to create store schema")?;

            Ok(Self {
                conn: Mutex::new(conn),
            })
        }
    }

    impl KeyValueStore for SqliteStore {
        fn get(&self, key: &str) -> Result<Option<String>> {
            let conn = self.conn.lock().map_err(|e| anyhow!("{}", e))?;
            conn.query_row(
                "SELECT value FROM kv_store WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("Failed to read key '{}'", key))
        }

        fn set(&self, key: &str, value: &str) -> Result<()> {
            let conn = self.conn.lock().map_err(|e| anyhow!("{}", e))?;
            let now = chrono::Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO kv_store (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE
                 SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, value, now],
            )
            .with_context(|| format!("Failed to write key '{}'", key))?;
            Ok(())
        }

        fn delete(&self, key: &str) -> Result<()> {
            let conn = self.conn.lock().map_err(|e| anyhow!("{}", e))?;
            conn.execute("DELETE FROM kv_store WHERE key = ?1", params![key])
                .with_context(|| format!("Failed to delete key '{}'", key))?;
            Ok(())
        }
    }

}
