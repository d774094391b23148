//! Agent registry: the durable roster of agent definitions
//!
//! Every mutation stages a copy of the roster, persists it under the
//! `registry` key and only then publishes it to readers.

use std::sync::Arc;

use muster_knowledge::{DocumentStore, keys, load_typed, save_typed};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{CoreError, CoreResult};
use crate::types::{AgentDefinition, MAX_AGENT_NAMES};

pub const DEFAULT_MAX_AGENTS: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RegistrySettings {
    max_agents: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RegistryDoc {
    #[serde(default)]
    agents: Vec<AgentDefinition>,
    settings: RegistrySettings,
}

impl Default for RegistryDoc {
    fn default() -> Self {
        Self {
            agents: Vec::new(),
            settings: RegistrySettings {
                max_agents: DEFAULT_MAX_AGENTS,
            },
        }
    }
}

pub struct Registry {
    store: Arc<dyn DocumentStore>,
    doc: RwLock<RegistryDoc>,
}

impl Registry {
    /// Load the registry, creating it with defaults on first use
    pub async fn open(store: Arc<dyn DocumentStore>) -> CoreResult<Self> {
        let doc = match load_typed::<RegistryDoc>(store.as_ref(), keys::REGISTRY).await? {
            Some(doc) => {
                info!(
                    "Registry: loaded {} agents (capacity {})",
                    doc.agents.len(),
                    doc.settings.max_agents
                );
                doc
            }
            None => {
                let doc = RegistryDoc::default();
                save_typed(store.as_ref(), keys::REGISTRY, &doc).await?;
                info!("Registry: created with capacity {}", doc.settings.max_agents);
                doc
            }
        };
        Ok(Self {
            store,
            doc: RwLock::new(doc),
        })
    }

    /// Change the capacity limit. Cannot drop below the current roster size.
    pub async fn set_capacity(&self, max_agents: usize) -> CoreResult<()> {
        let mut doc = self.doc.write().await;
        if max_agents < doc.agents.len() {
            return Err(CoreError::InvalidArgument(format!(
                "capacity {} is below the {} registered agents",
                max_agents,
                doc.agents.len()
            )));
        }
        if doc.settings.max_agents == max_agents {
            return Ok(());
        }
        let mut staged = doc.clone();
        staged.settings.max_agents = max_agents;
        save_typed(self.store.as_ref(), keys::REGISTRY, &staged).await?;
        *doc = staged;
        info!("Registry: capacity set to {}", max_agents);
        Ok(())
    }

    /// Apply a configured capacity at startup. A value below the current
    /// roster size is logged and the stored capacity kept, so the roster can
    /// still be trimmed. Returns the capacity in effect.
    pub async fn reconcile_capacity(&self, configured: usize) -> CoreResult<usize> {
        let (len, current) = {
            let doc = self.doc.read().await;
            (doc.agents.len(), doc.settings.max_agents)
        };
        if configured < len {
            warn!(
                "Registry: configured max_agents {} is below the {} registered agents; keeping {}",
                configured, len, current
            );
            return Ok(current);
        }
        match self.set_capacity(configured).await {
            Ok(()) => Ok(configured),
            // Roster grew between the read and the write
            Err(CoreError::InvalidArgument(msg)) => {
                warn!("Registry: {}; keeping {}", msg, current);
                Ok(self.capacity().await)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn add_agent(&self, agent: AgentDefinition) -> CoreResult<()> {
        validate(&agent)?;

        let mut doc = self.doc.write().await;
        if doc.agents.iter().any(|a| a.id == agent.id) {
            return Err(CoreError::AlreadyExists(agent.id));
        }
        if doc.agents.len() >= doc.settings.max_agents {
            return Err(CoreError::CapacityExceeded(doc.settings.max_agents));
        }

        let mut staged = doc.clone();
        staged.agents.push(agent.clone());
        save_typed(self.store.as_ref(), keys::REGISTRY, &staged).await?;
        *doc = staged;

        info!(
            "Registry: added agent '{}' ({}) as {}",
            agent.id,
            agent.role,
            agent.names.join("/")
        );
        Ok(())
    }

    /// Remove an agent definition. Its memory record is left alone.
    pub async fn remove_agent(&self, id: &str) -> CoreResult<AgentDefinition> {
        let mut doc = self.doc.write().await;
        let Some(pos) = doc.agents.iter().position(|a| a.id == id) else {
            return Err(CoreError::agent_not_found(id));
        };

        let mut staged = doc.clone();
        let removed = staged.agents.remove(pos);
        save_typed(self.store.as_ref(), keys::REGISTRY, &staged).await?;
        *doc = staged;

        info!("Registry: removed agent '{}' (memory retained)", id);
        Ok(removed)
    }

    pub async fn get(&self, id: &str) -> Option<AgentDefinition> {
        self.doc.read().await.agents.iter().find(|a| a.id == id).cloned()
    }

    /// All agents in insertion order
    pub async fn list(&self) -> Vec<AgentDefinition> {
        let agents = self.doc.read().await.agents.clone();
        debug!("Registry: listed {} agents", agents.len());
        agents
    }

    pub async fn len(&self) -> usize {
        self.doc.read().await.agents.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.doc.read().await.agents.is_empty()
    }

    pub async fn capacity(&self) -> usize {
        self.doc.read().await.settings.max_agents
    }
}

fn is_token(s: &str) -> bool {
    !s.is_empty() && !s.chars().any(char::is_whitespace)
}

/// Ids also name the agent's memory document, so they stay path-safe
fn is_path_safe(s: &str) -> bool {
    !s.starts_with('.') && !s.contains(['/', '\\', '\0'])
}

fn validate(agent: &AgentDefinition) -> CoreResult<()> {
    if !is_token(&agent.id) {
        return Err(CoreError::InvalidArgument(format!(
            "agent id '{}' must be non-empty with no whitespace",
            agent.id
        )));
    }
    if !is_path_safe(&agent.id) {
        return Err(CoreError::InvalidArgument(format!(
            "agent id '{}' must not contain '/', '\\' or start with '.'",
            agent.id
        )));
    }
    if agent.role.trim().is_empty() {
        return Err(CoreError::InvalidArgument("role must not be empty".into()));
    }
    if agent.names.is_empty() || agent.names.len() > MAX_AGENT_NAMES {
        return Err(CoreError::InvalidArgument(format!(
            "an agent needs 1 to {} names, got {}",
            MAX_AGENT_NAMES,
            agent.names.len()
        )));
    }
    if let Some(bad) = agent.names.iter().find(|n| !is_token(n)) {
        return Err(CoreError::InvalidArgument(format!(
            "name '{}' must be non-empty with no whitespace",
            bad
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use muster_knowledge::InMemoryStore;

    fn agent(id: &str, names: &[&str]) -> AgentDefinition {
        AgentDefinition::new(id, "writer", names.iter().map(|n| n.to_string()).collect())
    }

    async fn registry() -> (Arc<InMemoryStore>, Registry) {
        let store = Arc::new(InMemoryStore::new());
        let registry = Registry::open(store.clone()).await.unwrap();
        (store, registry)
    }

    #[tokio::test]
    async fn test_open_creates_defaults() {
        let (store, registry) = registry().await;
        assert_eq!(registry.capacity().await, DEFAULT_MAX_AGENTS);
        assert!(registry.is_empty().await);
        assert!(store.load(keys::REGISTRY).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_add_get_list_in_order() {
        let (_store, registry) = registry().await;
        registry.add_agent(agent("b", &["小B"])).await.unwrap();
        registry.add_agent(agent("a", &["小A"])).await.unwrap();

        let ids: Vec<_> = registry.list().await.into_iter().map(|a| a.id).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert_eq!(registry.get("a").await.unwrap().names, vec!["小A"]);
        assert!(registry.get("c").await.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_rejected() {
        let (_store, registry) = registry().await;
        registry.add_agent(agent("a1", &["小白"])).await.unwrap();
        let err = registry.add_agent(agent("a1", &["小黑"])).await.unwrap_err();
        assert!(matches!(err, CoreError::AlreadyExists(id) if id == "a1"));
        assert_eq!(registry.get("a1").await.unwrap().names, vec!["小白"]);
    }

    #[tokio::test]
    async fn test_capacity_exceeded_leaves_registry_unchanged() {
        let (store, registry) = registry().await;
        registry.set_capacity(2).await.unwrap();
        registry.add_agent(agent("a1", &["小白"])).await.unwrap();
        registry.add_agent(agent("a2", &["小黑"])).await.unwrap();
        let before = store.load(keys::REGISTRY).await.unwrap();

        let err = registry.add_agent(agent("a3", &["小红"])).await.unwrap_err();
        assert!(matches!(err, CoreError::CapacityExceeded(2)));
        assert_eq!(registry.len().await, 2);
        assert_eq!(store.load(keys::REGISTRY).await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_set_capacity_below_size_rejected() {
        let (_store, registry) = registry().await;
        registry.add_agent(agent("a1", &["小白"])).await.unwrap();
        registry.add_agent(agent("a2", &["小黑"])).await.unwrap();
        assert!(matches!(
            registry.set_capacity(1).await,
            Err(CoreError::InvalidArgument(_))
        ));
        assert_eq!(registry.capacity().await, DEFAULT_MAX_AGENTS);
    }

    #[tokio::test]
    async fn test_validation() {
        let (_store, registry) = registry().await;
        for bad in [
            agent("", &["小白"]),
            agent("a 1", &["小白"]),
            agent("a1", &[]),
            agent("a1", &["一", "二", "三", "四"]),
            agent("a1", &["小 白"]),
            AgentDefinition::new("a1", "  ", vec!["小白".into()]),
        ] {
            assert!(matches!(
                registry.add_agent(bad).await,
                Err(CoreError::InvalidArgument(_))
            ));
        }
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_remove_and_persistence() {
        let (store, registry) = registry().await;
        registry.add_agent(agent("a1", &["小白"])).await.unwrap();
        registry.add_agent(agent("a2", &["小黑"])).await.unwrap();

        let removed = registry.remove_agent("a1").await.unwrap();
        assert_eq!(removed.id, "a1");
        assert!(matches!(
            registry.remove_agent("a1").await,
            Err(CoreError::NotFound { kind: "agent", .. })
        ));

        let reopened = Registry::open(store).await.unwrap();
        let ids: Vec<_> = reopened.list().await.into_iter().map(|a| a.id).collect();
        assert_eq!(ids, vec!["a2"]);
    }

    #[tokio::test]
    async fn test_survives_reopen_on_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("muster.db");
        {
            let store = Arc::new(muster_knowledge::SqliteStore::new(&path).unwrap());
            let registry = Registry::open(store).await.unwrap();
            registry.set_capacity(5).await.unwrap();
            registry.add_agent(agent("a1", &["小助手"])).await.unwrap();
        }
        let store = Arc::new(muster_knowledge::SqliteStore::new(&path).unwrap());
        let registry = Registry::open(store).await.unwrap();
        assert_eq!(registry.capacity().await, 5);
        assert_eq!(registry.get("a1").await.unwrap().main_name(), "小助手");
    }

    #[tokio::test]
    async fn test_path_like_ids_rejected() {
        let (_store, registry) = registry().await;
        for id in ["a/b", "a\\b", ".hidden", "..", "a\0b"] {
            let err = registry.add_agent(agent(id, &["小白"])).await.unwrap_err();
            assert!(matches!(err, CoreError::InvalidArgument(_)), "{id}");
        }
        registry.add_agent(agent("a_b", &["小白"])).await.unwrap();
        registry.add_agent(agent("a.b", &["小黑"])).await.unwrap();
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn test_reconcile_capacity_below_roster_keeps_stored() {
        let (_store, registry) = registry().await;
        for id in ["a1", "a2", "a3"] {
            registry.add_agent(agent(id, &[id])).await.unwrap();
        }
        assert!(matches!(
            registry.set_capacity(2).await,
            Err(CoreError::InvalidArgument(_))
        ));

        assert_eq!(registry.reconcile_capacity(2).await.unwrap(), DEFAULT_MAX_AGENTS);
        assert_eq!(registry.capacity().await, DEFAULT_MAX_AGENTS);

        // Still usable: the operator can remove agents
        registry.remove_agent("a3").await.unwrap();
        assert_eq!(registry.reconcile_capacity(2).await.unwrap(), 2);
        assert_eq!(registry.capacity().await, 2);
    }
}
