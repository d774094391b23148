//! Outbound notification service
//!
//! Task lifecycle transitions, stuck alerts, periodic progress reports and
//! schedule reminders are formatted here and queued on a channel. A delivery
//! task drains the queue and hands each message to a `Notifier`, bounded by a
//! timeout. Failures are logged and never reach the caller.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Local, NaiveTime};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::NotifyError;
use crate::types::preview;

/// Outbound message transport
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;
    async fn notify(&self, message: &str) -> Result<(), NotifyError>;
}

/// Which kind of event triggered this notification
#[derive(Debug, Clone, PartialEq)]
pub enum NotifyEvent {
    TaskCreated {
        task_id: String,
        agent: String,
        content: String,
    },
    TaskCompleted {
        task_id: String,
        agent: String,
        content: String,
    },
    TaskCancelled {
        task_id: String,
        agent: String,
        content: String,
        note: Option<String>,
    },
    TaskStuck {
        task_id: String,
        agent: String,
        content: String,
        idle_minutes: i64,
    },
    ProgressReport {
        report: String,
    },
    ScheduleDigest {
        digest: String,
    },
    ScheduleReminder {
        message: String,
    },
}

/// Configuration for the notification service
#[derive(Debug, Clone)]
pub struct NotifyConfig {
    pub enabled: bool,
    pub on_task_created: bool,
    pub on_task_completed: bool,
    pub on_task_cancelled: bool,
    pub on_task_stuck: bool,
    pub on_progress_report: bool,
    pub on_schedule: bool,
    /// Local-time window during which non-urgent messages are dropped
    pub quiet_hours: Option<(NaiveTime, NaiveTime)>,
}

impl Default for NotifyConfig {
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

#[derive(Clone)]
pub struct NotificationService {
    config: NotifyConfig,
    clock: Arc<dyn Clock>,
    tx: mpsc::Sender<String>,
}

impl NotificationService {
    pub fn new(config: NotifyConfig, clock: Arc<dyn Clock>, tx: mpsc::Sender<String>) -> Self {
        if config.enabled {
            info!(
                "Notification service enabled (quiet_hours: {})",
                config
                    .quiet_hours
                    .map(|(s, e)| format!("{}-{}", s, e))
                    .unwrap_or_else(|| "none".to_string()),
            );
        }
        Self { config, clock, tx }
    }

    /// Queue a notification if the event type is enabled and we're not in quiet hours
    pub async fn notify(&self, event: NotifyEvent) {
        if !self.config.enabled {
            return;
        }
        if !self.should_notify(&event) {
            debug!("Notification suppressed (event type disabled): {:?}", event);
            return;
        }

        // Stuck alerts always go through
        let urgent = matches!(event, NotifyEvent::TaskStuck { .. });
        if !urgent && self.is_quiet_hours() {
            debug!("Notification suppressed (quiet hours): {:?}", event);
            return;
        }

        let content = format_message(&event);
        if let Err(e) = self.tx.send(content).await {
            warn!("Failed to queue notification: {}", e);
        }
    }

    fn should_notify(&self, event: &NotifyEvent) -> bool {
        match event {
            NotifyEvent::TaskCreated { .. } => self.config.on_task_created,
            NotifyEvent::TaskCompleted { .. } => self.config.on_task_completed,
            NotifyEvent::TaskCancelled { .. } => self.config.on_task_cancelled,
            NotifyEvent::TaskStuck { .. } => self.config.on_task_stuck,
            NotifyEvent::ProgressReport { .. } => self.config.on_progress_report,
            NotifyEvent::ScheduleDigest { .. } | NotifyEvent::ScheduleReminder { .. } => {
                self.config.on_schedule
            }
        }
    }

    fn is_quiet_hours(&self) -> bool {
        let Some((start, end)) = self.config.quiet_hours else {
            return false;
        };
        let now = self.clock.now().with_timezone(&Local).time();
        in_window(now, start, end)
    }
}

/// True if `now` falls in `[start, end)`, wrapping past midnight when start > end
fn in_window(now: NaiveTime, start: NaiveTime, end: NaiveTime) -> bool {
    if start <= end {
        now >= start && now < end
    } else {
        now >= start || now < end
    }
}

/// Render an event as the message text sent to the user
pub fn format_message(event: &NotifyEvent) -> String {
    match event {
        NotifyEvent::TaskCreated {
            task_id,
            agent,
            content,
        } => format!(
            "🚀 {} 开始新任务\n[{}] {}",
            agent,
            task_id,
            preview(content, 200)
        ),
        NotifyEvent::TaskCompleted {
            task_id,
            agent,
            content,
        } => format!(
            "✅ {} 完成了任务\n[{}] {}",
            agent,
            task_id,
            preview(content, 150)
        ),
        NotifyEvent::TaskCancelled {
            task_id,
            agent,
            content,
            note,
        } => {
            let mut msg = format!(
                "❌ {} 的任务已取消\n[{}] {}",
                agent,
                task_id,
                preview(content, 150)
            );
            if let Some(note) = note {
                msg.push_str(&format!("\n原因: {}", preview(note, 200)));
            }
            msg
        }
        NotifyEvent::TaskStuck {
            task_id,
            agent,
            content,
            idle_minutes,
        } => format!(
            "⚠️ {} 的任务已 {} 分钟没有进展\n[{}] {}",
            agent,
            idle_minutes,
            task_id,
            preview(content, 150)
        ),
        NotifyEvent::ProgressReport { report } => report.clone(),
        NotifyEvent::ScheduleDigest { digest } => digest.clone(),
        NotifyEvent::ScheduleReminder { message } => message.clone(),
    }
}

/// Drain queued messages into `notifier` until every sender is dropped
pub fn spawn_delivery(
    mut rx: mpsc::Receiver<String>,
    notifier: Arc<dyn Notifier>,
    timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Notification delivery started via {}", notifier.name());
        while let Some(message) = rx.recv().await {
            let result = match tokio::time::timeout(timeout, notifier.notify(&message)).await {
                Ok(result) => result,
                Err(_) => Err(NotifyError::Timeout(timeout.as_secs())),
            };
            match result {
                Ok(()) => debug!("Delivered notification ({} chars)", message.chars().count()),
                Err(e) => warn!("Notification via {} failed: {}", notifier.name(), e),
            }
        }
        info!("Notification delivery stopped");
    })
}
