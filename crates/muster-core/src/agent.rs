//! Hub: the entry point for one inbound message
//!
//! Addressed messages become tasks for the agent and are answered through the
//! conversational engine; everything else goes to the command interpreter.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::commands::CommandContext;
use crate::context::{PROMPT_HISTORY, PROMPT_SHARED, build_agent_prompt};
use crate::engine::{ConversationEngine, EngineOptions, generate_bounded};
use crate::error::CoreResult;
use crate::memory::MemoryStore;
use crate::registry::Registry;
use crate::resolver::resolve;
use crate::tasks::{TaskTracker, TaskUpdate};
use crate::types::{AgentDefinition, TurnRole};

const FALLBACK: &str = "🤔 没有识别到要呼唤的智能体。发送「帮助」查看可用命令。";

#[derive(Debug, Clone)]
pub struct HubSettings {
    /// Model used when the agent has no override
    pub default_model: Option<String>,
    pub engine_timeout: Duration,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            default_model: None,
            engine_timeout: Duration::from_secs(120),
        }
    }
}

/// How a message was handled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Agent {
        agent_id: String,
        task_id: Option<String>,
    },
    Command,
    Unrecognized,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubReply {
    pub route: Route,
    pub text: String,
}

pub struct Hub {
    registry: Arc<Registry>,
    memory: Arc<MemoryStore>,
    tasks: Arc<TaskTracker>,
    engine: Arc<dyn ConversationEngine>,
    settings: HubSettings,
}

impl Hub {
    pub fn new(
        registry: Arc<Registry>,
        memory: Arc<MemoryStore>,
        tasks: Arc<TaskTracker>,
        engine: Arc<dyn ConversationEngine>,
        settings: HubSettings,
    ) -> Self {
        info!(
            "Hub ready (engine: {}, default model: {})",
            engine.name(),
            settings.default_model.as_deref().unwrap_or("engine default")
        );
        Self {
            registry,
            memory,
            tasks,
            engine,
            settings,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn memory(&self) -> &Arc<MemoryStore> {
        &self.memory
    }

    pub fn tasks(&self) -> &Arc<TaskTracker> {
        &self.tasks
    }

    /// Handle one inbound message. Never fails; problems become reply text.
    pub async fn handle_message(&self, text: &str) -> HubReply {
        let text = text.trim();
        let agents = self.registry.list().await;
        let resolution = resolve(text, &agents);

        if let Some(agent_id) = resolution.agent_id
            && let Some(agent) = agents.iter().find(|a| a.id == agent_id)
        {
            debug!(
                "Hub: message for '{}' via '{}'",
                agent.id,
                resolution.matched_name.as_deref().unwrap_or(&agent.id)
            );
            return self.dispatch(agent, &resolution.residual).await;
        }

        let ctx = CommandContext {
            registry: &self.registry,
            memory: &self.memory,
            tasks: &self.tasks,
        };
        match ctx.interpret(text).await {
            Some(reply) => HubReply {
                route: Route::Command,
                text: reply,
            },
            None => {
                debug!("Hub: unrecognized message");
                HubReply {
                    route: Route::Unrecognized,
                    text: FALLBACK.to_string(),
                }
            }
        }
    }

    async fn dispatch(&self, agent: &AgentDefinition, residual: &str) -> HubReply {
        let main_name = agent.main_name();
        if residual.is_empty() {
            return HubReply {
                route: Route::Agent {
                    agent_id: agent.id.clone(),
                    task_id: None,
                },
                text: format!("{}在呢，有什么需要帮忙的？", main_name),
            };
        }

        let task_id = match self.tasks.create_task(&agent.id, residual).await {
            Ok(task) => Some(task.id),
            Err(e) => {
                warn!("Hub: could not record task for '{}': {}", agent.id, e);
                None
            }
        };

        let text = match self.converse(agent, residual).await {
            Ok(reply) => {
                if let Some(id) = &task_id
                    && let Err(e) = self.tasks.update_task(id, TaskUpdate::complete()).await
                {
                    warn!("Hub: could not complete task {}: {}", id, e);
                }
                reply
            }
            Err(diagnostic) => {
                warn!("Hub: '{}' could not answer: {}", agent.id, diagnostic);
                if let Some(id) = &task_id
                    && let Err(e) = self
                        .tasks
                        .update_task(id, TaskUpdate::cancel(diagnostic.clone()))
                        .await
                {
                    warn!("Hub: could not cancel task {}: {}", id, e);
                }
                format!(
                    "抱歉，{}暂时无法回复（{}），请稍后再试。",
                    main_name, diagnostic
                )
            }
        };

        HubReply {
            route: Route::Agent {
                agent_id: agent.id.clone(),
                task_id,
            },
            text,
        }
    }

    /// Prompt the engine and record the exchange. Errors come back as a short diagnostic.
    async fn converse(&self, agent: &AgentDefinition, message: &str) -> Result<String, String> {
        let (history, shared) = self
            .context_for(agent)
            .await
            .map_err(|e| e.to_string())?;
        let prompt = build_agent_prompt(agent, &history, &shared, message);

        let options = EngineOptions {
            model: agent
                .model
                .clone()
                .or_else(|| self.settings.default_model.clone()),
            timeout: self.settings.engine_timeout,
        };
        let reply = generate_bounded(self.engine.as_ref(), &prompt, &options)
            .await
            .map_err(|e| e.to_string())?;

        if let Err(e) = self.record_exchange(&agent.id, message, &reply).await {
            warn!("Hub: could not save history for '{}': {}", agent.id, e);
        }
        info!(
            "Hub: '{}' replied ({} chars)",
            agent.id,
            reply.chars().count()
        );
        Ok(reply)
    }

    async fn context_for(
        &self,
        agent: &AgentDefinition,
    ) -> CoreResult<(Vec<crate::types::Turn>, Vec<crate::types::SharedItem>)> {
        let history = self.memory.get_history(&agent.id, PROMPT_HISTORY).await?;
        let shared = self.memory.get_shared_knowledge(PROMPT_SHARED).await?;
        Ok((history, shared))
    }

    async fn record_exchange(&self, agent_id: &str, message: &str, reply: &str) -> CoreResult<()> {
        self.memory
            .append_turn(agent_id, TurnRole::User, message)
            .await?;
        self.memory
            .append_turn(agent_id, TurnRole::Assistant, reply)
            .await
    }
}
