use anyhow::{Context, Result, anyhow};
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::warn;

use muster_core::notifications::NotifyConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MusterConfig {
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub notifier: NotifierConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_max_agents")]
    pub max_agents: usize,
}

fn default_max_agents() -> usize {
    muster_core::registry::DEFAULT_MAX_AGENTS
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_agents: default_max_agents(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Sqlite,
    Json,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: StorageBackend,
    /// SQLite file, or the directory for the JSON backend
    #[serde(default = "default_storage_path")]
    pub path: String,
}

fn default_backend() -> StorageBackend {
    StorageBackend::Sqlite
}

fn default_storage_path() -> String {
    "~/.muster/muster.db".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: default_storage_path(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_engine_base_url")]
    pub base_url: String,
    #[serde(default = "default_engine_model")]
    pub default_model: String,
    #[serde(default = "default_engine_timeout")]
    pub timeout_secs: u64,
    /// Bearer token for an Ollama instance behind an authenticating proxy
    #[serde(default)]
    pub api_key: String,
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("base_url", &self.base_url)
            .field("default_model", &self.default_model)
            .field("timeout_secs", &self.timeout_secs)
            .field("api_key", &mask_secret(&self.api_key))
            .finish()
    }
}

fn default_engine_base_url() -> String {
    muster_core::providers::ollama::DEFAULT_BASE_URL.to_string()
}
fn default_engine_model() -> String {
    muster_core::providers::ollama::DEFAULT_MODEL.to_string()
}
fn default_engine_timeout() -> u64 {
    120
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: default_engine_base_url(),
            default_model: default_engine_model(),
            timeout_secs: default_engine_timeout(),
            api_key: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifierKind {
    Log,
    Command,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierConfig {
    #[serde(default = "default_notifier_kind")]
    pub kind: NotifierKind,
    /// Program to run for `kind = "command"`; the message is passed as the last argument
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_notifier_timeout")]
    pub timeout_secs: u64,
}

fn default_notifier_kind() -> NotifierKind {
    NotifierKind::Log
}
fn default_notifier_timeout() -> u64 {
    30
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            kind: default_notifier_kind(),
            command: String::new(),
            args: Vec::new(),
            timeout_secs: default_notifier_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub on_task_created: bool,
    #[serde(default = "default_true")]
    pub on_task_completed: bool,
    #[serde(default = "default_true")]
    pub on_task_cancelled: bool,
    #[serde(default = "default_true")]
    pub on_task_stuck: bool,
    #[serde(default = "default_true")]
    pub on_progress_report: bool,
    #[serde(default = "default_true")]
    pub on_schedule: bool,
    /// Quiet hours: suppress notifications during this window (except stuck alerts)
    #[serde(default)]
    pub quiet_hours: Option<QuietHoursConfig>,
}

fn default_true() -> bool {
    true
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            on_task_created: true,
            on_task_completed: true,
            on_task_cancelled: true,
            on_task_stuck: true,
            on_progress_report: true,
            on_schedule: true,
            quiet_hours: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuietHoursConfig {
    pub start: String,
    pub end: String,
}

impl NotificationsConfig {
    pub fn to_notify_config(&self) -> Result<NotifyConfig> {
        let quiet_hours = match &self.quiet_hours {
            Some(q) => Some((parse_hhmm(&q.start)?, parse_hhmm(&q.end)?)),
            None => None,
        };
        Ok(NotifyConfig {
            enabled: self.enabled,
            on_task_created: self.on_task_created,
            on_task_completed: self.on_task_completed,
            on_task_cancelled: self.on_task_cancelled,
            on_task_stuck: self.on_task_stuck,
            on_progress_report: self.on_progress_report,
            on_schedule: self.on_schedule,
            quiet_hours,
        })
    }
}

fn parse_hhmm(s: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M")
        .with_context(|| format!("Invalid time '{}' in quiet_hours (expected HH:MM)", s))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_report_interval")]
    pub report_interval_mins: u64,
    #[serde(default = "default_stuck_after")]
    pub stuck_after_mins: i64,
    #[serde(default = "default_poll_interval")]
    pub reminder_poll_secs: u64,
    /// Six-field cron expression (with seconds) for the daily digest, local time
    #[serde(default = "default_digest_cron")]
    pub digest_cron: String,
    /// Keyword -> minutes of advance notice, checked before the built-in table
    #[serde(default)]
    pub lead_overrides: BTreeMap<String, i64>,
}

fn default_poll_interval() -> u64 {
    60
}
fn default_report_interval() -> u64 {
    30
}
fn default_stuck_after() -> i64 {
    muster_core::tasks::DEFAULT_STUCK_MINUTES
}
fn default_digest_cron() -> String {
    muster_scheduler::DEFAULT_DIGEST_CRON.to_string()
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            report_interval_mins: default_report_interval(),
            stuck_after_mins: default_stuck_after(),
            reminder_poll_secs: default_poll_interval(),
            digest_cron: default_digest_cron(),
            lead_overrides: BTreeMap::new(),
        }
    }
}

/// Mask a secret string for safe display in Debug output / logs.
/// Shows first 3 and last 4 chars for keys longer than 7 chars, otherwise "***".
pub fn mask_secret(s: &str) -> String {
    if s.is_empty() {
        return "(empty)".to_string();
    }
    let chars: Vec<char> = s.chars().collect();
    if chars.len() > 7 {
        let prefix: String = chars[..3].iter().collect();
        let suffix: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", prefix, suffix)
    } else {
        "***".to_string()
    }
}

pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".muster")
}

impl MusterConfig {
    pub fn load(custom_path: &Option<PathBuf>) -> Result<Self> {
        let path = custom_path
            .clone()
            .unwrap_or_else(|| config_dir().join("config.toml"));

        // Refuse group/world readable configs; they may hold the engine token
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(metadata) = std::fs::metadata(&path) {
                let mode = metadata.permissions().mode();
                if mode & 0o077 != 0 {
                    return Err(anyhow!(
                        "Config file {:?} has overly permissive permissions ({:o}). \
                         It may contain secrets. Fix with: chmod 600 {:?}",
                        path,
                        mode & 0o777,
                        path
                    ));
                }
            }
        }

        let content = std::fs::read_to_string(&path).with_context(|| {
            format!(
                "Failed to read config at {}. Run `muster init` first.",
                path.display()
            )
        })?;

        Self::parse(&content).with_context(|| format!("Failed to parse config at {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: Self = toml::from_str(&expanded)?;
        config.validate()?;

        if !config.engine.api_key.is_empty() && !content.contains("${") {
            warn!(
                "Engine api_key is hardcoded in config file. For security, use environment variables: api_key = \"${{MUSTER_ENGINE_API_KEY}}\""
            );
        }
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.registry.max_agents == 0 {
            return Err(anyhow!("registry.max_agents must be at least 1"));
        }
        if self.engine.timeout_secs == 0 {
            return Err(anyhow!("engine.timeout_secs must be at least 1"));
        }
        if self.notifier.kind == NotifierKind::Command && self.notifier.command.trim().is_empty() {
            return Err(anyhow!("notifier.command is required when notifier.kind = \"command\""));
        }
        if self.scheduler.poll_interval_secs == 0 || self.scheduler.reminder_poll_secs == 0 {
            return Err(anyhow!("scheduler poll intervals must be at least 1 second"));
        }
        self.notifications.to_notify_config()?;
        Ok(())
    }

    /// Copy safe to print: secrets replaced by their masked form
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if !copy.engine.api_key.is_empty() {
            copy.engine.api_key = mask_secret(&copy.engine.api_key);
        }
        copy
    }
}

/// Allowlist of environment variable names that may be expanded in config files.
/// This prevents an attacker who can modify the config from reading arbitrary env vars.
const ALLOWED_ENV_VARS: &[&str] = &[
    "MUSTER_ENGINE_API_KEY",
    "MUSTER_HOME",
    "OLLAMA_HOST",
    "HOME",
    "USER",
];

fn expand_env_vars(s: &str) -> String {
    let mut result = s.to_string();
    let mut pos = 0;
    while pos < result.len() {
        let Some(start) = result[pos..].find("${") else {
            break;
        };
        let abs_start = pos + start;
        let Some(end) = result[abs_start..].find('}') else {
            break;
        };
        let var_name = result[abs_start + 2..abs_start + end].to_string();

        if !ALLOWED_ENV_VARS.contains(&var_name.as_str()) {
            warn!(
                "Skipping expansion of unrecognized env var '{}' in config (not in allowlist)",
                var_name
            );
            // Leave the ${VAR} unexpanded so it's obvious
            pos = abs_start + end + 1;
            continue;
        }

        let value = std::env::var(&var_name).unwrap_or_default();
        result = format!(
            "{}{}{}",
            &result[..abs_start],
            value,
            &result[abs_start + end + 1..]
        );
        pos = abs_start + value.len();
    }
    result
}

/// Expand a leading `~/` to the home directory
pub fn expand_home(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest);
    }
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_parses() {
        let cfg = MusterConfig::parse(include_str!("../../../config/default.toml")).unwrap();
        assert_eq!(cfg.registry.max_agents, 100);
        assert_eq!(cfg.storage.backend, StorageBackend::Sqlite);
        assert_eq!(cfg.engine.default_model, "qwen2:0.5b");
        assert_eq!(cfg.notifier.kind, NotifierKind::Log);
        assert_eq!(cfg.scheduler.digest_cron, "0 30 8 * * *");
        assert_eq!(cfg.scheduler.stuck_after_mins, 10);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let cfg = MusterConfig::parse("").unwrap();
        assert_eq!(cfg.scheduler.poll_interval_secs, 60);
        assert_eq!(cfg.scheduler.report_interval_mins, 30);
        assert!(cfg.notifications.enabled);
        assert!(cfg.notifications.quiet_hours.is_none());
    }

    #[test]
    fn test_quiet_hours_and_overrides() {
        let cfg = MusterConfig::parse(
            r#"
[notifications]
quiet_hours = { start = "23:00", end = "07:30" }

[scheduler.lead_overrides]
"机场" = 180
"#,
        )
        .unwrap();
        let notify = cfg.notifications.to_notify_config().unwrap();
        let (start, end) = notify.quiet_hours.unwrap();
        assert_eq!(start, NaiveTime::from_hms_opt(23, 0, 0).unwrap());
        assert_eq!(end, NaiveTime::from_hms_opt(7, 30, 0).unwrap());
        assert_eq!(cfg.scheduler.lead_overrides["机场"], 180);
    }

    #[test]
    fn test_invalid_configs_rejected() {
        assert!(MusterConfig::parse("[registry]\nmax_agents = 0").is_err());
        assert!(MusterConfig::parse("[notifier]\nkind = \"command\"").is_err());
        assert!(MusterConfig::parse("[storage]\nbackend = \"redis\"").is_err());
        assert!(
            MusterConfig::parse(
                "[notifications]\nquiet_hours = { start = \"late\", end = \"07:00\" }"
            )
            .is_err()
        );
    }

    #[test]
    fn test_mask_secret() {
        assert_eq!(mask_secret(""), "(empty)");
        assert_eq!(mask_secret("short"), "***");
        assert_eq!(mask_secret("abcdefghijkl"), "abc...ijkl");
    }

    #[test]
    fn test_debug_and_redacted_hide_key() {
        let mut cfg = MusterConfig::parse("").unwrap();
        cfg.engine.api_key = "secret-token-1234".into();
        assert!(!format!("{:?}", cfg).contains("secret-token-1234"));
        assert_eq!(cfg.redacted().engine.api_key, "sec...1234");
    }

    #[test]
    fn test_env_expansion_allowlist() {
        let out = expand_env_vars("a = \"${NOT_ALLOWED_VAR}\"");
        assert_eq!(out, "a = \"${NOT_ALLOWED_VAR}\"");
        let out = expand_env_vars("k = \"${MUSTER_HOME_UNSET_SUFFIX\"");
        assert_eq!(out, "k = \"${MUSTER_HOME_UNSET_SUFFIX\"");
    }

    #[test]
    fn test_load_rejects_open_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "").unwrap();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();
            assert!(MusterConfig::load(&Some(path.clone())).is_err());
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).unwrap();
        }
        assert!(MusterConfig::load(&Some(path)).is_ok());
    }

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home("/tmp/x.db"), PathBuf::from("/tmp/x.db"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home("~/.muster/x.db"), home.join(".muster/x.db"));
        }
    }
}
