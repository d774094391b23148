//! Agent resolver: figures out which agent a free-text message addresses
//!
//! Every display name and every agent id is an addressing token. Tokens are
//! tried longest first so that "小美丽" wins over "小美". For each token six
//! address shapes are tried in order; the first hit decides the agent and its
//! fragment is stripped from the message to form the residual task text.

use regex::Regex;
use tracing::debug;

use crate::types::AgentDefinition;

/// Lead words that address the agent rather than describe the task.
/// A bare single-character verb only counts when it stands alone, so the
/// 请 of "请假" stays with the task.
const LEAD: &str = r"(?:帮我|帮忙|请你|[帮请让叫](?:\s+|$))";
const VERB: &str = "[帮请让叫]";
const CLAUSE: &str = "[，。、,]";
const COLON: &str = "[:：]";

/// Outcome of resolving one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub agent_id: Option<String>,
    /// Message with the addressing fragment removed, trimmed
    pub residual: String,
    /// The token that matched (a display name or the agent id)
    pub matched_name: Option<String>,
}

impl Resolution {
    fn unmatched(text: &str) -> Self {
        Self {
            agent_id: None,
            residual: text.to_string(),
            matched_name: None,
        }
    }
}

/// Build the six address shapes for one escaped token
fn shapes(token: &str) -> Vec<String> {
    let n = regex::escape(token);
    vec![
        format!(r"^{n}{COLON}?\s*{LEAD}?"),
        format!(r"^{n}\s+{LEAD}?"),
        format!(r"^{n}(?:{LEAD}|{VERB})"),
        format!(r"{VERB}{n}{COLON}?\s*"),
        format!(r"{CLAUSE}{n}{COLON}?\s*"),
        format!(r"{CLAUSE}{n}\s+"),
    ]
}

/// Token → agent id, longest token first. Earlier-registered agents keep
/// contested tokens.
fn address_tokens(agents: &[AgentDefinition]) -> Vec<(String, String)> {
    let mut tokens: Vec<(String, String)> = Vec::new();
    for agent in agents {
        for token in agent.names.iter().chain(std::iter::once(&agent.id)) {
            if token.is_empty() || tokens.iter().any(|(t, _)| t == token) {
                continue;
            }
            tokens.push((token.clone(), agent.id.clone()));
        }
    }
    tokens.sort_by(|a, b| b.0.chars().count().cmp(&a.0.chars().count()));
    tokens
}

/// Resolve `text` against a registry snapshot. Never fails.
pub fn resolve(text: &str, agents: &[AgentDefinition]) -> Resolution {
    for (token, agent_id) in address_tokens(agents) {
        for pattern in shapes(&token) {
            let Ok(re) = Regex::new(&pattern) else {
                continue;
            };
            let Some(m) = re.find(text) else {
                continue;
            };

            let fragment = m.as_str();
            let mut residual = format!("{}{}", &text[..m.start()], &text[m.end()..]);
            residual = residual.trim().to_string();
            let trimmed_fragment = fragment.trim();
            if !trimmed_fragment.is_empty() {
                while let Some(rest) = residual.strip_prefix(trimmed_fragment) {
                    residual = rest.trim().to_string();
                }
            }

            debug!(
                "Resolver: '{}' matched agent '{}' via '{}' (pattern {})",
                text, agent_id, token, pattern
            );
            return Resolution {
                agent_id: Some(agent_id),
                residual,
                matched_name: Some(token),
            };
        }
    }

    debug!("Resolver: no agent addressed");
    Resolution::unmatched(text)
}
