//! SQLite document backing

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::DocumentStore;

/// SQLite database wrapper (thread-safe via Arc<Mutex>)
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database and initialize the schema
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).context("Failed to open SQLite database")?;
        info!("Opening document store at {:?}", path.as_ref());
        Self::with_connection(conn)
    }

    /// In-memory database, mostly useful for tests
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory SQLite")?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS documents (
                key TEXT PRIMARY KEY,
                body TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )
        .context("Failed to create documents table")?;

        debug!("Document schema initialized");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    fn backend_name(&self) -> &str {
        "sqlite"
    }

    async fn load(&self, key: &str) -> Result<Option<Value>> {
        let conn = Arc::clone(&self.conn);
        let key = key.to_owned();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(|poisoned| {
                warn!("Database mutex was poisoned, recovering");
                poisoned.into_inner()
            });
            let body: Option<String> = conn
                .query_row(
                    "SELECT body FROM documents WHERE key = ?1",
                    params![&key],
                    |row| row.get(0),
                )
                .optional()
                .with_context(|| format!("Failed to read document '{}'", key))?;

            body.map(|b| {
                serde_json::from_str(&b)
                    .with_context(|| format!("Document '{}' is not valid JSON", key))
            })
            .transpose()
        })
        .await
        .context("spawn_blocking task panicked")?
    }

    async fn save(&self, key: &str, doc: &Value) -> Result<()> {
        let conn = Arc::clone(&self.conn);
        let key = key.to_owned();
        let body = serde_json::to_string(doc).context("Failed to encode document")?;

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(|poisoned| {
                warn!("Database mutex was poisoned, recovering");
                poisoned.into_inner()
            });
            conn.execute(
                "INSERT INTO documents (key, body, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET
                    body = excluded.body,
                    updated_at = excluded.updated_at",
                params![&key, &body, Utc::now().to_rfc3339()],
            )
            .with_context(|| format!("Failed to write document '{}'", key))?;
            debug!("Saved document: {} ({} bytes)", key, body.len());
            Ok(())
        })
        .await
        .context("spawn_blocking task panicked")?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_save_and_load() -> Result<()> {
        let store = SqliteStore::open_in_memory()?;
        assert!(store.load("registry").await?.is_none());

        store.save("registry", &json!({"max_agents": 2})).await?;
        assert_eq!(store.load("registry").await?, Some(json!({"max_agents": 2})));

        store.save("registry", &json!({"max_agents": 5})).await?;
        assert_eq!(store.load("registry").await?, Some(json!({"max_agents": 5})));
        Ok(())
    }

    #[tokio::test]
    async fn test_persists_across_reopen() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("muster.db");

        {
            let store = SqliteStore::new(&path)?;
            store
                .save("memory/a1", &json!({"history": [{"content": "你好"}]}))
                .await?;
        }

        let store = SqliteStore::new(&path)?;
        let doc = store.load("memory/a1").await?.unwrap();
        assert_eq!(doc["history"][0]["content"], "你好");
        Ok(())
    }

    #[tokio::test]
    async fn test_keys_are_independent() -> Result<()> {
        let store = SqliteStore::open_in_memory()?;
        store.save("memory/a1", &json!(1)).await?;
        store.save("memory/a2", &json!(2)).await?;
        assert_eq!(store.load("memory/a1").await?, Some(json!(1)));
        assert_eq!(store.load("memory/a2").await?, Some(json!(2)));
        Ok(())
    }
}
