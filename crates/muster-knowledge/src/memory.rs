//! Volatile in-process backing

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::DocumentStore;

/// Keeps documents in a map; nothing survives the process
#[derive(Default)]
pub struct InMemoryStore {
    docs: RwLock<HashMap<String, Value>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored documents
    pub async fn len(&self) -> usize {
        self.docs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.docs.read().await.is_empty()
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    fn backend_name(&self) -> &str {
        "memory"
    }

    async fn load(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.docs.read().await.get(key).cloned())
    }

    async fn save(&self, key: &str, doc: &Value) -> Result<()> {
        self.docs.write().await.insert(key.to_string(), doc.clone());
        Ok(())
    }
}
