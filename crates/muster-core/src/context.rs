//! Prompt assembly for an addressed agent

use tracing::debug;

use crate::types::{AgentDefinition, SharedItem, Turn, TurnRole};

/// Turns of history included in a prompt
pub const PROMPT_HISTORY: usize = 10;
/// Shared knowledge items included in a prompt
pub const PROMPT_SHARED: usize = 10;

/// Build the full prompt: persona, history, shared knowledge, then the message
pub fn build_agent_prompt(
    agent: &AgentDefinition,
    history: &[Turn],
    shared: &[SharedItem],
    message: &str,
) -> String {
    let main_name = agent.main_name();
    let mut prompt = String::new();

    prompt.push_str(&format!(
        "你是{}智能体，主名「{}」，{}。\n",
        agent.id, main_name, agent.role
    ));
    if agent.description.trim().is_empty() {
        prompt.push_str("无描述\n");
    } else {
        prompt.push_str(agent.description.trim());
        prompt.push('\n');
    }
    prompt.push_str(&format!("\n## 可用名字：{}\n", agent.names.join("、")));

    prompt.push_str("\n## 对话历史\n");
    let recent = &history[history.len().saturating_sub(PROMPT_HISTORY)..];
    if recent.is_empty() {
        prompt.push_str("（暂无历史）\n");
    }
    for turn in recent {
        let label = match turn.role {
            TurnRole::Assistant => "你",
            TurnRole::User => "用户",
        };
        prompt.push_str(&format!("{}: {}\n", label, turn.content));
    }

    let shared = &shared[shared.len().saturating_sub(PROMPT_SHARED)..];
    if !shared.is_empty() {
        prompt.push_str("\n## 共享知识\n");
        for item in shared {
            prompt.push_str(&format!("- {}\n", item.content));
        }
    }

    prompt.push_str(&format!(
        "\n你是{}，用这个身份专业地回复用户。\n\n用户: {}\n{}:",
        main_name, message, main_name
    ));

    debug!(
        "Built prompt for '{}' ({} chars, {} turns, {} shared)",
        agent.id,
        prompt.chars().count(),
        recent.len(),
        shared.len()
    );
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn agent() -> AgentDefinition {
        AgentDefinition::new("a1", "文案助手", vec!["小白".into(), "白白".into()])
            .with_description("擅长写短句")
    }

    fn turn(role: TurnRole, content: &str) -> Turn {
        Turn {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_prompt_sections_in_order() {
        let history = vec![turn(TurnRole::User, "你好"), turn(TurnRole::Assistant, "在的")];
        let shared = vec![SharedItem {
            content: "主人喜欢简短".into(),
            added_at: Utc::now(),
        }];
        let prompt = build_agent_prompt(&agent(), &history, &shared, "写一句话");

        let identity = prompt.find("主名「小白」").unwrap();
        let names = prompt.find("可用名字：小白、白白").unwrap();
        let hist = prompt.find("## 对话历史").unwrap();
        let know = prompt.find("## 共享知识").unwrap();
        let msg = prompt.find("用户: 写一句话").unwrap();
        assert!(identity < names && names < hist && hist < know && know < msg);
        assert!(prompt.contains("用户: 你好\n你: 在的"));
        assert!(prompt.contains("擅长写短句"));
        assert!(prompt.ends_with("小白:"));
    }

    #[test]
    fn test_prompt_without_history_or_shared() {
        let prompt = build_agent_prompt(&AgentDefinition::new("a2", "r", vec!["小黑".into()]), &[], &[], "hi");
        assert!(prompt.contains("（暂无历史）"));
        assert!(prompt.contains("无描述"));
        assert!(!prompt.contains("共享知识"));
    }

    #[test]
    fn test_prompt_keeps_only_recent_turns() {
        let history: Vec<_> = (0..15)
            .map(|i| turn(TurnRole::User, &format!("msg-{:02}", i)))
            .collect();
        let prompt = build_agent_prompt(&agent(), &history, &[], "x");
        assert!(!prompt.contains("msg-04"));
        assert!(prompt.contains("msg-05"));
        assert!(prompt.contains("msg-14"));
    }
}
