//! Persistence layer for muster
//!
//! Every piece of durable state (the agent registry, each agent's memory
//! record, the shared knowledge pool, the task table) is a single JSON
//! document addressed by a string key. This crate provides:
//! - The `DocumentStore` trait with whole-document load/save semantics
//! - SQLite, JSON-directory and in-memory backings
//! - Typed helpers for loading and saving serde types

pub mod json_dir;
pub mod memory;
pub mod sqlite;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

pub use json_dir::JsonDirStore;
pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

/// Well-known document keys
pub mod keys {
    pub const REGISTRY: &str = "registry";
    pub const SHARED: &str = "shared";
    pub const TASKS: &str = "tasks";
    pub const REMINDERS: &str = "reminders";

    /// Key of one agent's memory record
    pub fn memory(agent_id: &str) -> String {
        format!("memory/{}", agent_id)
    }
}

/// Key-addressed document storage.
///
/// `save` must be atomic: after it returns `Ok` the whole document is durable,
/// and a failed save leaves the previous version in place.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Short backend name for logs (e.g. "sqlite")
    fn backend_name(&self) -> &str;

    /// Load a document, `None` if the key was never written
    async fn load(&self, key: &str) -> Result<Option<Value>>;

    /// Replace a document
    async fn save(&self, key: &str, doc: &Value) -> Result<()>;
}

/// Load a document and deserialize it into `T`
pub async fn load_typed<T: DeserializeOwned>(
    store: &dyn DocumentStore,
    key: &str,
) -> Result<Option<T>> {
    match store.load(key).await? {
        Some(value) => {
            let doc = serde_json::from_value(value)
                .with_context(|| format!("Malformed document at key '{}'", key))?;
            Ok(Some(doc))
        }
        None => Ok(None),
    }
}

/// Serialize `doc` and save it under `key`
pub async fn save_typed<T: Serialize + ?Sized>(
    store: &dyn DocumentStore,
    key: &str,
    doc: &T,
) -> Result<()> {
    let value = serde_json::to_value(doc)
        .with_context(|| format!("Failed to serialize document for key '{}'", key))?;
    store.save(key, &value).await
}
