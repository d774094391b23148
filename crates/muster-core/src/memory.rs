//! Per-agent conversational memory and the shared knowledge pool
//!
//! Each agent's record is one document (`memory/<id>`). Writers to the same
//! agent serialize on a per-agent lock; different agents proceed in parallel.

use std::sync::Arc;

use dashmap::DashMap;
use muster_knowledge::{DocumentStore, keys, load_typed, save_typed};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::{CoreError, CoreResult};
use crate::types::{KnowledgeEntry, MemoryRecord, SharedItem, Turn, TurnRole};

/// Turns kept per agent, oldest evicted first
pub const HISTORY_LIMIT: usize = 100;
/// Items kept in the shared pool, oldest evicted first
pub const SHARED_LIMIT: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStats {
    pub history: usize,
    pub knowledge: usize,
}

pub struct MemoryStore {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    agent_locks: DashMap<String, Arc<Mutex<()>>>,
    shared_lock: Mutex<()>,
}

impl MemoryStore {
    pub fn new(store: Arc<dyn DocumentStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            agent_locks: DashMap::new(),
            shared_lock: Mutex::new(()),
        }
    }

    fn lock_for(&self, agent_id: &str) -> Arc<Mutex<()>> {
        self.agent_locks
            .entry(agent_id.to_string())
            .or_default()
            .clone()
    }

    /// Read a record, synthesizing an empty one if none was ever written
    pub async fn load(&self, agent_id: &str) -> CoreResult<MemoryRecord> {
        let record = load_typed::<MemoryRecord>(self.store.as_ref(), &keys::memory(agent_id))
            .await?
            .unwrap_or_else(|| MemoryRecord::empty(agent_id));
        Ok(record)
    }

    async fn save(&self, record: &mut MemoryRecord) -> CoreResult<()> {
        record.last_updated = Some(self.clock.now());
        save_typed(self.store.as_ref(), &keys::memory(&record.agent_id), record).await?;
        Ok(())
    }

    /// Create an empty record if the agent has none. Returns true if created.
    pub async fn init_record(&self, agent_id: &str) -> CoreResult<bool> {
        let lock = self.lock_for(agent_id);
        let _guard = lock.lock().await;

        if self.store.load(&keys::memory(agent_id)).await?.is_some() {
            debug!("Memory: reusing existing record for '{}'", agent_id);
            return Ok(false);
        }
        let mut record = MemoryRecord::empty(agent_id);
        self.save(&mut record).await?;
        info!("Memory: initialized record for '{}'", agent_id);
        Ok(true)
    }

    pub async fn append_turn(&self, agent_id: &str, role: TurnRole, content: &str) -> CoreResult<()> {
        let lock = self.lock_for(agent_id);
        let _guard = lock.lock().await;

        let mut record = self.load(agent_id).await?;
        record.history.push(Turn {
            role,
            content: content.to_string(),
            timestamp: self.clock.now(),
        });
        if record.history.len() > HISTORY_LIMIT {
            let excess = record.history.len() - HISTORY_LIMIT;
            record.history.drain(..excess);
        }
        self.save(&mut record).await?;
        debug!(
            "Memory: appended {} turn for '{}' ({} kept)",
            role,
            agent_id,
            record.history.len()
        );
        Ok(())
    }

    /// Last `limit` turns, oldest first
    pub async fn get_history(&self, agent_id: &str, limit: usize) -> CoreResult<Vec<Turn>> {
        let mut history = self.load(agent_id).await?.history;
        let skip = history.len().saturating_sub(limit);
        history.drain(..skip);
        Ok(history)
    }

    pub async fn add_knowledge(
        &self,
        agent_id: &str,
        kind: &str,
        content: &str,
    ) -> CoreResult<KnowledgeEntry> {
        if content.trim().is_empty() {
            return Err(CoreError::InvalidArgument("knowledge content is empty".into()));
        }
        let lock = self.lock_for(agent_id);
        let _guard = lock.lock().await;

        let mut record = self.load(agent_id).await?;
        let entry = KnowledgeEntry {
            kind: kind.to_string(),
            content: content.trim().to_string(),
            added_at: self.clock.now(),
        };
        record.knowledge.push(entry.clone());
        self.save(&mut record).await?;
        info!("Memory: added {} knowledge for '{}'", kind, agent_id);
        Ok(entry)
    }

    pub async fn knowledge(&self, agent_id: &str) -> CoreResult<Vec<KnowledgeEntry>> {
        Ok(self.load(agent_id).await?.knowledge)
    }

    pub async fn stats(&self, agent_id: &str) -> CoreResult<MemoryStats> {
        let record = self.load(agent_id).await?;
        Ok(MemoryStats {
            history: record.history.len(),
            knowledge: record.knowledge.len(),
        })
    }

    pub async fn add_shared_knowledge(&self, content: &str) -> CoreResult<SharedItem> {
        if content.trim().is_empty() {
            return Err(CoreError::InvalidArgument("shared knowledge is empty".into()));
        }
        let _guard = self.shared_lock.lock().await;

        let mut items = self.load_shared().await?;
        let item = SharedItem {
            content: content.trim().to_string(),
            added_at: self.clock.now(),
        };
        items.push(item.clone());
        if items.len() > SHARED_LIMIT {
            let excess = items.len() - SHARED_LIMIT;
            items.drain(..excess);
        }
        save_typed(self.store.as_ref(), keys::SHARED, &items).await?;
        info!("Memory: shared knowledge now holds {} items", items.len());
        Ok(item)
    }

    /// Last `limit` shared items, oldest first
    pub async fn get_shared_knowledge(&self, limit: usize) -> CoreResult<Vec<SharedItem>> {
        let mut items = self.load_shared().await?;
        let skip = items.len().saturating_sub(limit);
        items.drain(..skip);
        Ok(items)
    }

    async fn load_shared(&self) -> CoreResult<Vec<SharedItem>> {
        Ok(load_typed::<Vec<SharedItem>>(self.store.as_ref(), keys::SHARED)
            .await?
            .unwrap_or_default())
    }
}
