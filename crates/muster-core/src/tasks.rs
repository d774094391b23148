//! Task tracker
//!
//! The whole task table is one document (`tasks`). Creation and updates are
//! serialized by the table's write lock; readers work on snapshots. Tasks move
//! from in_progress to completed or cancelled and never leave a terminal state.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use muster_knowledge::{DocumentStore, keys, load_typed, save_typed};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{CoreError, CoreResult};
use crate::notifications::{NotificationService, NotifyEvent};
use crate::types::{TaskRecord, TaskStatus, preview};

/// Minutes without an update after which an in-progress task counts as stuck
pub const DEFAULT_STUCK_MINUTES: i64 = 10;

type TaskTable = BTreeMap<String, TaskRecord>;

/// Fields to change on a task; `None` leaves a field alone
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskUpdate {
    pub progress: Option<String>,
    pub status: Option<TaskStatus>,
    pub note: Option<String>,
}

impl TaskUpdate {
    pub fn progress(progress: impl Into<String>) -> Self {
        Self {
            progress: Some(progress.into()),
            ..Default::default()
        }
    }

    pub fn complete() -> Self {
        Self {
            status: Some(TaskStatus::Completed),
            ..Default::default()
        }
    }

    pub fn cancel(note: impl Into<String>) -> Self {
        Self {
            status: Some(TaskStatus::Cancelled),
            note: Some(note.into()),
            ..Default::default()
        }
    }
}

/// An active task with its staleness flag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveTask {
    pub task: TaskRecord,
    pub stuck: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Partition {
    /// In-progress tasks, oldest first
    pub active: Vec<ActiveTask>,
    /// Finished tasks, most recently updated first
    pub history: Vec<TaskRecord>,
}

pub struct TaskTracker {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    table: RwLock<TaskTable>,
    stuck_after: Duration,
    notifications: Option<NotificationService>,
}

impl TaskTracker {
    pub async fn open(store: Arc<dyn DocumentStore>, clock: Arc<dyn Clock>) -> CoreResult<Self> {
        let table = load_typed::<TaskTable>(store.as_ref(), keys::TASKS)
            .await?
            .unwrap_or_default();
        info!("TaskTracker: loaded {} tasks", table.len());
        Ok(Self {
            store,
            clock,
            table: RwLock::new(table),
            stuck_after: Duration::minutes(DEFAULT_STUCK_MINUTES),
            notifications: None,
        })
    }

    pub fn with_notifications(mut self, notifications: NotificationService) -> Self {
        self.notifications = Some(notifications);
        self
    }

    pub fn with_stuck_threshold(mut self, minutes: i64) -> Self {
        self.stuck_after = Duration::minutes(minutes);
        self
    }

    pub fn stuck_threshold(&self) -> Duration {
        self.stuck_after
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    async fn emit(&self, event: NotifyEvent) {
        if let Some(svc) = &self.notifications {
            svc.notify(event).await;
        }
    }

    pub async fn create_task(&self, agent_id: &str, content: &str) -> CoreResult<TaskRecord> {
        if agent_id.trim().is_empty() {
            return Err(CoreError::InvalidArgument("task needs an agent id".into()));
        }
        if content.trim().is_empty() {
            return Err(CoreError::InvalidArgument("task content is empty".into()));
        }

        let record = {
            let mut table = self.table.write().await;
            let now = self.clock.now();
            let stamp = now.format("%Y%m%d%H%M%S");
            let id = loop {
                let suffix = Uuid::new_v4().simple().to_string();
                let candidate = format!("{}_{}_{}", agent_id, stamp, &suffix[..8]);
                if !table.contains_key(&candidate) {
                    break candidate;
                }
            };

            let record = TaskRecord {
                id: id.clone(),
                agent_id: agent_id.to_string(),
                content: content.trim().to_string(),
                status: TaskStatus::InProgress,
                progress: "0%".to_string(),
                created_at: now,
                updated_at: now,
                note: None,
            };

            let mut staged = table.clone();
            staged.insert(id, record.clone());
            save_typed(self.store.as_ref(), keys::TASKS, &staged).await?;
            *table = staged;
            record
        };

        info!(
            "TaskTracker: created {} for '{}': {}",
            record.id,
            record.agent_id,
            preview(&record.content, 30)
        );
        self.emit(NotifyEvent::TaskCreated {
            task_id: record.id.clone(),
            agent: record.agent_id.clone(),
            content: record.content.clone(),
        })
        .await;
        Ok(record)
    }

    pub async fn update_task(&self, task_id: &str, update: TaskUpdate) -> CoreResult<TaskRecord> {
        let progress = update.progress.as_deref().map(normalize_progress).transpose()?;

        let (record, finished) = {
            let mut table = self.table.write().await;
            let Some(current) = table.get(task_id) else {
                return Err(CoreError::task_not_found(task_id));
            };
            if current.status.is_terminal() {
                return Err(CoreError::TerminalState {
                    id: task_id.to_string(),
                    status: current.status,
                });
            }

            let mut record = current.clone();
            if let Some(status) = update.status {
                record.status = status;
                if status == TaskStatus::Completed && progress.is_none() {
                    record.progress = "100%".to_string();
                }
            }
            if let Some(progress) = progress {
                record.progress = progress;
            }
            if let Some(note) = update.note {
                record.note = Some(note);
            }
            record.updated_at = self.clock.now().max(record.created_at);

            let mut staged = table.clone();
            staged.insert(task_id.to_string(), record.clone());
            save_typed(self.store.as_ref(), keys::TASKS, &staged).await?;
            *table = staged;

            let finished = record.status.is_terminal();
            (record, finished)
        };

        debug!(
            "TaskTracker: updated {} ({}, {})",
            record.id, record.status, record.progress
        );
        if finished {
            info!("TaskTracker: {} is now {}", record.id, record.status);
            let event = match record.status {
                TaskStatus::Completed => NotifyEvent::TaskCompleted {
                    task_id: record.id.clone(),
                    agent: record.agent_id.clone(),
                    content: record.content.clone(),
                },
                _ => NotifyEvent::TaskCancelled {
                    task_id: record.id.clone(),
                    agent: record.agent_id.clone(),
                    content: record.content.clone(),
                    note: record.note.clone(),
                },
            };
            self.emit(event).await;
        }
        Ok(record)
    }

    pub async fn get(&self, task_id: &str) -> Option<TaskRecord> {
        self.table.read().await.get(task_id).cloned()
    }

    /// Tasks for one agent (or all), oldest first
    pub async fn list_tasks(&self, agent_id: Option<&str>) -> Vec<TaskRecord> {
        let table = self.table.read().await;
        let mut tasks: Vec<TaskRecord> = table
            .values()
            .filter(|t| agent_id.is_none_or(|id| t.agent_id == id))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        tasks
    }

    /// Number of in-progress tasks for an agent
    pub async fn active_count(&self, agent_id: &str) -> usize {
        self.table
            .read()
            .await
            .values()
            .filter(|t| t.agent_id == agent_id && t.status == TaskStatus::InProgress)
            .count()
    }

    pub async fn partition_active_history(&self, now: DateTime<Utc>) -> Partition {
        let tasks = self.list_tasks(None).await;
        let mut partition = Partition::default();
        for task in tasks {
            if task.status == TaskStatus::InProgress {
                let stuck = is_stuck(&task, now, self.stuck_after);
                partition.active.push(ActiveTask { task, stuck });
            } else {
                partition.history.push(task);
            }
        }
        partition
            .history
            .sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        partition
    }
}

/// In progress and not updated for longer than `threshold`
pub fn is_stuck(task: &TaskRecord, now: DateTime<Utc>, threshold: Duration) -> bool {
    task.status == TaskStatus::InProgress && now - task.updated_at > threshold
}

/// Accept "40", "40%" or " 40 % " and return "40%"
pub fn normalize_progress(raw: &str) -> CoreResult<String> {
    let digits = raw.trim().trim_end_matches('%').trim();
    match digits.parse::<u8>() {
        Ok(n) if n <= 100 => Ok(format!("{}%", n)),
        _ => Err(CoreError::InvalidArgument(format!(
            "progress must be 0-100, got '{}'",
            raw
        ))),
    }
}

/// Text used both for the periodic report and the on-demand command
pub fn render_report(active: &[ActiveTask]) -> String {
    if active.is_empty() {
        return "📋 目前没有进行中的任务".to_string();
    }
    let mut lines = vec!["📋 任务进度汇报：".to_string()];
    for entry in active {
        let t = &entry.task;
        lines.push(format!("  • {}: {}", t.agent_id, preview(&t.content, 25)));
        let flag = if entry.stuck { " ⚠️ 长时间无进展" } else { "" };
        lines.push(format!(
            "    进度: {} | 状态: {}{}",
            t.progress,
            t.status.label(),
            flag
        ));
    }
    lines.join("\n")
}
