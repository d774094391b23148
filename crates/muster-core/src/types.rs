//! Shared types for muster-core

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum number of display names per agent
pub const MAX_AGENT_NAMES: usize = 3;

/// A registered agent persona
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub id: String,
    pub role: String,
    #[serde(default)]
    pub description: String,
    /// Display names, first one is the main name
    pub names: Vec<String>,
    /// Engine model override for this agent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl AgentDefinition {
    pub fn new(id: impl Into<String>, role: impl Into<String>, names: Vec<String>) -> Self {
        Self {
            id: id.into(),
            role: role.into(),
            description: String::new(),
            names,
            model: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Canonical display name (falls back to the id)
    pub fn main_name(&self) -> &str {
        self.names.first().map(|n| n.as_str()).unwrap_or(&self.id)
    }
}

/// Who said a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
}

impl std::fmt::Display for TurnRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
        }
    }
}

/// One conversation turn in an agent's history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: TurnRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Free-form knowledge entry, tagged by kind (e.g. "schedule")
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    #[serde(rename = "type")]
    pub kind: String,
    pub content: String,
    pub added_at: DateTime<Utc>,
}

impl KnowledgeEntry {
    pub const SCHEDULE: &'static str = "schedule";
    pub const NOTE: &'static str = "note";
}

/// Entry in the shared knowledge pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedItem {
    pub content: String,
    pub added_at: DateTime<Utc>,
}

/// Per-agent durable memory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub agent_id: String,
    #[serde(default)]
    pub history: Vec<Turn>,
    #[serde(default)]
    pub knowledge: Vec<KnowledgeEntry>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

impl MemoryRecord {
    pub fn empty(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            history: Vec::new(),
            knowledge: Vec::new(),
            last_updated: None,
        }
    }
}

/// Lifecycle state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    InProgress,
    Completed,
    Cancelled,
}

impl TaskStatus {
    /// Completed and cancelled tasks never change again
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress)
    }

    /// Label used in chat replies
    pub fn label(&self) -> &'static str {
        match self {
            Self::InProgress => "进行中",
            Self::Completed => "已完成",
            Self::Cancelled => "已取消",
        }
    }

    /// Parse user input: snake_case names, short English forms and the chat labels
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "in_progress" | "running" | "active" | "进行中" => Some(Self::InProgress),
            "completed" | "done" | "complete" | "已完成" | "完成" => Some(Self::Completed),
            "cancelled" | "canceled" | "cancel" | "已取消" | "取消" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InProgress => write!(f, "in_progress"),
            Self::Completed => write!(f, "completed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A unit of work dispatched to an agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub agent_id: String,
    pub content: String,
    pub status: TaskStatus,
    pub progress: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Take at most `max` characters of `s`
pub fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Like `truncate_chars`, appending "..." when something was cut
pub fn preview(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        format!("{}...", truncate_chars(s, max))
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_main_name() {
        let agent = AgentDefinition::new("a1", "writer", vec!["小白".into(), "白白".into()]);
        assert_eq!(agent.main_name(), "小白");

        let unnamed = AgentDefinition::new("a2", "writer", vec![]);
        assert_eq!(unnamed.main_name(), "a2");
    }

    #[test]
    fn test_task_status_serde() {
        let json = serde_json::to_string(&TaskStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
        let parsed: TaskStatus = serde_json::from_str("\"cancelled\"").unwrap();
        assert_eq!(parsed, TaskStatus::Cancelled);
    }

    #[test]
    fn test_task_status_parse() {
        assert_eq!(TaskStatus::parse("done"), Some(TaskStatus::Completed));
        assert_eq!(TaskStatus::parse("已取消"), Some(TaskStatus::Cancelled));
        assert_eq!(TaskStatus::parse(" In_Progress "), Some(TaskStatus::InProgress));
        assert_eq!(TaskStatus::parse("paused"), None);
        assert!(TaskStatus::Completed.is_terminal());
        assert!(!TaskStatus::InProgress.is_terminal());
    }

    #[test]
    fn test_knowledge_entry_uses_type_key() {
        let entry = KnowledgeEntry {
            kind: KnowledgeEntry::SCHEDULE.into(),
            content: "2026年3月1日 09:00 开会".into(),
            added_at: Utc::now(),
        };
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["type"], "schedule");
    }

    #[test]
    fn test_preview() {
        assert_eq!(preview("写一句话", 10), "写一句话");
        assert_eq!(preview("一二三四五", 3), "一二三...");
        assert_eq!(truncate_chars("héllo", 2), "hé");
    }
}
