//! Administrative command interpreter
//!
//! Consulted only when no agent is addressed. Commands are matched through an
//! ordered dispatch table; the first matching row wins. Malformed arguments
//! produce a usage reply rather than an error.

use tracing::{debug, warn};

use crate::error::CoreError;
use crate::memory::MemoryStore;
use crate::registry::Registry;
use crate::resolver::resolve;
use crate::tasks::{TaskTracker, render_report};
use crate::types::{AgentDefinition, KnowledgeEntry, TaskStatus, preview};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    ListAgents,
    AddAgent,
    RemoveAgent,
    InspectMemory,
    ListTasks,
    ShareKnowledge,
    Help,
    ProgressReport,
    AddSchedule,
}

#[derive(Debug, Clone, Copy)]
enum Matcher {
    /// Whole message equals one of the keywords
    Exact(&'static [&'static str]),
    /// Message starts with one of the keywords (each ends in a space)
    Prefix(&'static [&'static str]),
}

const DISPATCH: &[(Matcher, CommandKind)] = &[
    (
        Matcher::Exact(&["列出助手", "助手列表", "有哪些助手", "状态", "智能体", "list"]),
        CommandKind::ListAgents,
    ),
    (
        Matcher::Prefix(&["添加智能体 ", "添加 ", "新增 "]),
        CommandKind::AddAgent,
    ),
    (
        Matcher::Prefix(&["删除智能体 ", "删除 "]),
        CommandKind::RemoveAgent,
    ),
    (
        Matcher::Prefix(&["查看记忆 ", "记忆 "]),
        CommandKind::InspectMemory,
    ),
    (
        Matcher::Exact(&["任务", "任务列表", "所有任务", "tasks"]),
        CommandKind::ListTasks,
    ),
    (Matcher::Prefix(&["共享 "]), CommandKind::ShareKnowledge),
    (Matcher::Exact(&["help", "帮助", "命令"]), CommandKind::Help),
    (
        Matcher::Exact(&["进度", "汇报", "report"]),
        CommandKind::ProgressReport,
    ),
    (Matcher::Prefix(&["日程 "]), CommandKind::AddSchedule),
];

const HELP: &str = "📖 命令：
🎯 呼唤智能体：编号 或 主名/昵称，如「小白帮我写一句话」
📋 管理：列出助手 / 添加 编号 角色 [名字1、名字2] [描述] / 删除 编号
📊 记忆：记忆 编号或名字 / 共享 内容 / 日程 编号或名字 内容
📋 任务：任务 / 进度";

/// Find the command for `text` and its argument string
pub fn match_command(text: &str) -> Option<(CommandKind, &str)> {
    let text = text.trim();
    for (matcher, kind) in DISPATCH {
        match matcher {
            Matcher::Exact(words) => {
                if words.contains(&text) {
                    return Some((*kind, ""));
                }
            }
            Matcher::Prefix(prefixes) => {
                for prefix in *prefixes {
                    // A bare keyword still selects the command so it can answer with usage
                    if text == prefix.trim_end() {
                        return Some((*kind, ""));
                    }
                    if let Some(args) = text.strip_prefix(prefix) {
                        return Some((*kind, args.trim()));
                    }
                }
            }
        }
    }
    None
}

/// Split off up to `max` whitespace-separated fields; the last takes the remainder
fn split_fields(s: &str, max: usize) -> Vec<&str> {
    let mut out = Vec::new();
    let mut rest = s.trim();
    while !rest.is_empty() {
        if out.len() + 1 == max {
            out.push(rest);
            break;
        }
        match rest.find(char::is_whitespace) {
            Some(i) => {
                out.push(&rest[..i]);
                rest = rest[i..].trim_start();
            }
            None => {
                out.push(rest);
                break;
            }
        }
    }
    out
}

/// Shared state the interpreter reads and mutates
pub struct CommandContext<'a> {
    pub registry: &'a Registry,
    pub memory: &'a MemoryStore,
    pub tasks: &'a TaskTracker,
}

impl CommandContext<'_> {
    /// Interpret `text` as an administrative command; `None` if it is not one
    pub async fn interpret(&self, text: &str) -> Option<String> {
        let (kind, args) = match_command(text)?;
        debug!("Commands: matched {:?} with args '{}'", kind, args);

        let reply = match kind {
            CommandKind::ListAgents => self.list_agents().await,
            CommandKind::AddAgent => self.add_agent(args).await,
            CommandKind::RemoveAgent => self.remove_agent(args).await,
            CommandKind::InspectMemory => self.inspect_memory(args).await,
            CommandKind::ListTasks => Ok(self.list_tasks().await),
            CommandKind::ShareKnowledge => self.share(args).await,
            CommandKind::Help => Ok(HELP.to_string()),
            CommandKind::ProgressReport => {
                let partition = self
                    .tasks
                    .partition_active_history(self.tasks.clock().now())
                    .await;
                Ok(render_report(&partition.active))
            }
            CommandKind::AddSchedule => self.add_schedule(args).await,
        };

        Some(reply.unwrap_or_else(|e| {
            warn!("Commands: {:?} failed: {}", kind, e);
            format!("❌ 操作失败：{}", e)
        }))
    }

    /// Find an agent by id, falling back to a display name
    async fn lookup(&self, query: &str) -> Option<AgentDefinition> {
        if let Some(agent) = self.registry.get(query).await {
            return Some(agent);
        }
        let agents = self.registry.list().await;
        let resolved = resolve(query, &agents).agent_id?;
        agents.into_iter().find(|a| a.id == resolved)
    }

    async fn list_agents(&self) -> Result<String, CoreError> {
        let agents = self.registry.list().await;
        if agents.is_empty() {
            return Ok("📋 暂无智能体".to_string());
        }
        let mut lines = vec![format!(
            "📋 已注册的智能体（{}/{}）：",
            agents.len(),
            self.registry.capacity().await
        )];
        for agent in &agents {
            let stats = self.memory.stats(&agent.id).await?;
            let active = self.tasks.active_count(&agent.id).await;
            let mut line = format!(
                "• {} | 主名「{}」| {} (历史{}条)",
                agent.id,
                agent.main_name(),
                agent.role,
                stats.history
            );
            if active > 0 {
                line.push_str(&format!(" (任务: {}进行中)", active));
            }
            lines.push(line);
        }
        Ok(lines.join("\n"))
    }

    async fn add_agent(&self, args: &str) -> Result<String, CoreError> {
        const USAGE: &str = "格式：添加 编号 角色 [名字1、名字2] [描述]";
        let fields = split_fields(args, 4);
        if fields.len() < 2 {
            return Ok(format!("❌ {}", USAGE));
        }
        let id = fields[0];
        let role = fields[1];
        let mut names: Vec<String> = fields
            .get(2)
            .map(|raw| {
                raw.split('、')
                    .map(str::trim)
                    .filter(|n| !n.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        if names.is_empty() {
            names.push(id.to_string());
        }
        let description = fields.get(3).copied().unwrap_or("");

        let agent = AgentDefinition::new(id, role, names).with_description(description);
        let main_name = agent.main_name().to_string();
        match self.registry.add_agent(agent).await {
            Ok(()) => {
                // The agent is registered; a missing record is synthesized on read
                if let Err(e) = self.memory.init_record(id).await {
                    warn!("Commands: memory record for '{}' not created: {}", id, e);
                }
                Ok(format!("✅ 已添加 {}「{}」({})", id, main_name, role))
            }
            Err(CoreError::AlreadyExists(id)) => Ok(format!("❌ {} 已存在", id)),
            Err(CoreError::CapacityExceeded(max)) => Ok(format!("❌ 已达上限{}", max)),
            Err(CoreError::InvalidArgument(msg)) => Ok(format!("❌ {}\n{}", msg, USAGE)),
            Err(e) => Err(e),
        }
    }

    async fn remove_agent(&self, args: &str) -> Result<String, CoreError> {
        let Some(id) = split_fields(args, 2).first().copied() else {
            return Ok("❌ 格式：删除 编号".to_string());
        };
        match self.registry.remove_agent(id).await {
            Ok(_) => Ok(format!("✅ 已删除 {}（记忆保留）", id)),
            Err(CoreError::NotFound { .. }) => Ok(format!("❌ {} 不存在", id)),
            Err(e) => Err(e),
        }
    }

    async fn inspect_memory(&self, args: &str) -> Result<String, CoreError> {
        if args.is_empty() {
            return Ok("❌ 格式：记忆 编号或名字".to_string());
        }
        let id = match self.lookup(args).await {
            Some(agent) => agent.id,
            None => args.to_string(),
        };
        let stats = self.memory.stats(&id).await?;
        Ok(format!(
            "📊 {} 历史{}条，知识{}条",
            id, stats.history, stats.knowledge
        ))
    }

    async fn list_tasks(&self) -> String {
        let active: Vec<_> = self
            .tasks
            .list_tasks(None)
            .await
            .into_iter()
            .filter(|t| t.status == TaskStatus::InProgress)
            .collect();
        if active.is_empty() {
            return "📋 暂无进行中的任务".to_string();
        }
        let mut lines = vec!["📋 进行中的任务：".to_string()];
        for t in &active {
            lines.push(format!(
                "  • {}: {} [{}]",
                t.agent_id,
                preview(&t.content, 30),
                t.progress
            ));
        }
        lines.join("\n")
    }

    async fn share(&self, args: &str) -> Result<String, CoreError> {
        if args.is_empty() {
            return Ok("❌ 格式：共享 内容".to_string());
        }
        self.memory.add_shared_knowledge(args).await?;
        Ok("✅ 已添加到共享知识库".to_string())
    }

    async fn add_schedule(&self, args: &str) -> Result<String, CoreError> {
        let fields = split_fields(args, 2);
        if fields.len() < 2 {
            return Ok("❌ 格式：日程 编号或名字 内容".to_string());
        }
        let Some(agent) = self.lookup(fields[0]).await else {
            return Ok(format!("❌ {} 不存在", fields[0]));
        };
        self.memory
            .add_knowledge(&agent.id, KnowledgeEntry::SCHEDULE, fields[1])
            .await?;
        Ok(format!("✅ 已为 {}「{}」记录日程", agent.id, agent.main_name()))
    }
}
