//! Task monitor: stuck-task alerts and periodic progress reports

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use muster_core::notifications::{NotificationService, NotifyEvent};
use muster_core::tasks::{TaskTracker, render_report};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub poll_interval: Duration,
    pub report_interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            report_interval: Duration::from_secs(30 * 60),
        }
    }
}

/// What one poll did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollOutcome {
    pub stuck_alerts: usize,
    pub reported: bool,
}

pub struct TaskMonitor {
    tasks: Arc<TaskTracker>,
    notifications: NotificationService,
    config: MonitorConfig,
    /// Task id -> `updated_at` of the task when it was last alerted on
    alerted: HashMap<String, DateTime<Utc>>,
    last_report: DateTime<Utc>,
}

impl TaskMonitor {
    pub fn new(
        tasks: Arc<TaskTracker>,
        notifications: NotificationService,
        config: MonitorConfig,
    ) -> Self {
        let last_report = tasks.clock().now();
        Self {
            tasks,
            notifications,
            config,
            alerted: HashMap::new(),
            last_report,
        }
    }

    /// Inspect the task table once
    pub async fn poll(&mut self, now: DateTime<Utc>) -> PollOutcome {
        let partition = self.tasks.partition_active_history(now).await;
        let mut outcome = PollOutcome::default();

        // Forget tasks that finished so the map stays bounded
        self.alerted
            .retain(|id, _| partition.active.iter().any(|a| &a.task.id == id));

        for entry in partition.active.iter().filter(|a| a.stuck) {
            let task = &entry.task;
            // One alert per stuck episode; an update re-arms it
            if self.alerted.get(&task.id) == Some(&task.updated_at) {
                continue;
            }
            self.alerted.insert(task.id.clone(), task.updated_at);
            let idle_minutes = (now - task.updated_at).num_minutes();
            info!(
                "Monitor: task {} for '{}' idle for {} min",
                task.id, task.agent_id, idle_minutes
            );
            self.notifications
                .notify(NotifyEvent::TaskStuck {
                    task_id: task.id.clone(),
                    agent: task.agent_id.clone(),
                    content: task.content.clone(),
                    idle_minutes,
                })
                .await;
            outcome.stuck_alerts += 1;
        }

        let report_due = chrono::Duration::from_std(self.config.report_interval)
            .map(|interval| now - self.last_report >= interval)
            .unwrap_or(false);
        if report_due {
            self.last_report = now;
            if partition.active.is_empty() {
                debug!("Monitor: report due but no active tasks");
            } else {
                self.notifications
                    .notify(NotifyEvent::ProgressReport {
                        report: render_report(&partition.active),
                    })
                    .await;
                outcome.reported = true;
                info!(
                    "Monitor: sent progress report for {} tasks",
                    partition.active.len()
                );
            }
        }
        outcome
    }

    /// Poll on an interval until `shutdown` fires
    pub fn spawn(mut self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "Task monitor started (poll {:?}, report every {:?})",
                self.config.poll_interval, self.config.report_interval
            );
            let mut interval = tokio::time::interval(self.config.poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("Task monitor stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        let now = self.tasks.clock().now();
                        let outcome = self.poll(now).await;
                        debug!("Monitor poll: {:?}", outcome);
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use muster_core::clock::{Clock, ManualClock};
    use muster_core::notifications::NotifyConfig;
    use muster_core::tasks::TaskUpdate;
    use muster_knowledge::InMemoryStore;
    use tokio::sync::mpsc;

    async fn setup() -> (Arc<ManualClock>, Arc<TaskTracker>, TaskMonitor, mpsc::Receiver<String>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let tasks = Arc::new(
            TaskTracker::open(Arc::new(InMemoryStore::new()), clock.clone())
                .await
                .unwrap(),
        );
        let (tx, rx) = mpsc::channel(64);
        let config = NotifyConfig {
            on_task_created: false,
            on_task_completed: false,
            ..Default::default()
        };
        let svc = NotificationService::new(config, clock.clone(), tx);
        let monitor = TaskMonitor::new(tasks.clone(), svc, MonitorConfig::default());
        (clock, tasks, monitor, rx)
    }

    #[tokio::test]
    async fn test_one_alert_per_stuck_episode() {
        let (clock, tasks, mut monitor, mut rx) = setup().await;
        let task = tasks.create_task("a1", "写一句话").await.unwrap();

        clock.advance(ChronoDuration::minutes(9));
        assert_eq!(monitor.poll(clock.now()).await.stuck_alerts, 0);

        clock.advance(ChronoDuration::minutes(2));
        assert_eq!(monitor.poll(clock.now()).await.stuck_alerts, 1);
        assert!(rx.try_recv().unwrap().contains("11 分钟"));

        clock.advance(ChronoDuration::minutes(1));
        assert_eq!(monitor.poll(clock.now()).await.stuck_alerts, 0);

        // Progress re-arms the alert
        tasks.update_task(&task.id, TaskUpdate::progress("50")).await.unwrap();
        clock.advance(ChronoDuration::minutes(11));
        assert_eq!(monitor.poll(clock.now()).await.stuck_alerts, 1);
    }

    #[tokio::test]
    async fn test_report_only_when_active() {
        let (clock, tasks, mut monitor, mut rx) = setup().await;

        clock.advance(ChronoDuration::minutes(31));
        assert!(!monitor.poll(clock.now()).await.reported);
        assert!(rx.try_recv().is_err());

        let task = tasks.create_task("a1", "写一句话").await.unwrap();
        clock.advance(ChronoDuration::minutes(5));
        assert!(!monitor.poll(clock.now()).await.reported);

        tasks.update_task(&task.id, TaskUpdate::progress("20")).await.unwrap();
        clock.advance(ChronoDuration::minutes(26));
        let outcome = monitor.poll(clock.now()).await;
        assert!(outcome.reported);
        // The task is also stuck by now, so a stuck alert precedes the report
        let mut messages = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            messages.push(msg);
        }
        let report = messages
            .iter()
            .find(|m| m.contains("任务进度汇报"))
            .unwrap();
        assert!(report.contains("20%"));
    }

    #[tokio::test]
    async fn test_spawned_monitor_stops_on_cancel() {
        let (_clock, _tasks, monitor, _rx) = setup().await;
        let shutdown = CancellationToken::new();
        let handle = monitor.spawn(shutdown.clone());
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
