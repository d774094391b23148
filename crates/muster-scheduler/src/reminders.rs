//! Schedule reminders
//!
//! Knowledge entries of type `schedule` that mention a date like
//! `2026年3月1日` and one or more `HH:MM` times become occurrences. A daily
//! digest lists them, and each occurrence gets one reminder ahead of time.
//! Reminded occurrences are kept in a persisted ledger.

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Local, NaiveDate, NaiveDateTime, NaiveTime};
use muster_core::clock::Clock;
use muster_core::memory::MemoryStore;
use muster_core::notifications::{NotificationService, NotifyEvent};
use muster_core::registry::Registry;
use muster_core::types::KnowledgeEntry;
use muster_knowledge::{DocumentStore, keys, load_typed, save_typed};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Keyword → minutes of advance notice
pub const DEFAULT_LEADS: &[(&str, i64)] = &[
    ("机场", 240),
    ("接小朋友", 25),
    ("开会", 15),
    ("上课", 15),
    ("家长会", 30),
];
pub const DEFAULT_LEAD_MINUTES: i64 = 30;
/// Occurrences further in the past than this are marked done without a reminder
pub const MISSED_GRACE_MINUTES: i64 = 60;
pub const DEFAULT_DIGEST_CRON: &str = "0 30 8 * * *";

const WEEKDAYS: [&str; 7] = ["周一", "周二", "周三", "周四", "周五", "周六", "周日"];

/// A dated time pulled out of a schedule entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Occurrence {
    pub agent_id: String,
    pub at: NaiveDateTime,
    /// First line of the entry
    pub title: String,
    pub lead_minutes: i64,
}

const KEY_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M";

impl Occurrence {
    fn key(&self) -> String {
        format!("{}@{}", self.agent_id, self.at.format(KEY_TIME_FORMAT))
    }
}

/// Date part of a ledger key, `None` if the key is not in `agent@time` form
fn key_date(key: &str) -> Option<NaiveDate> {
    let (_, at) = key.rsplit_once('@')?;
    NaiveDateTime::parse_from_str(at, KEY_TIME_FORMAT)
        .ok()
        .map(|at| at.date())
}

/// Next digest deadline after one was handled at `handled_at`.
/// Starts from whichever is later so a late send never repeats.
fn next_deadline(
    schedule: &cron::Schedule,
    deadline: DateTime<Local>,
    handled_at: DateTime<Local>,
) -> Option<DateTime<Local>> {
    schedule.after(&deadline.max(handled_at)).next()
}

/// Time left until `deadline`, zero once it has passed
fn until(deadline: DateTime<Local>, now: DateTime<Local>) -> Duration {
    (deadline - now).to_std().unwrap_or(Duration::ZERO)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ReminderLedger {
    #[serde(default)]
    reminded: BTreeSet<String>,
    #[serde(default)]
    lead_overrides: BTreeMap<String, i64>,
}

/// Extract every (date, time) in one schedule entry. Duplicated times count once.
pub fn parse_occurrence_times(content: &str) -> Vec<NaiveDateTime> {
    let (Ok(date_re), Ok(time_re)) = (
        Regex::new(r"(\d{4})年(\d{1,2})月(\d{1,2})日"),
        Regex::new(r"(\d{1,2})[:：](\d{2})"),
    ) else {
        return Vec::new();
    };

    let Some(date) = date_re.captures(content).and_then(|c| {
        NaiveDate::from_ymd_opt(c[1].parse().ok()?, c[2].parse().ok()?, c[3].parse().ok()?)
    }) else {
        return Vec::new();
    };

    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for c in time_re.captures_iter(content) {
        let (Ok(h), Ok(m)) = (c[1].parse::<u32>(), c[2].parse::<u32>()) else {
            continue;
        };
        let Some(time) = NaiveTime::from_hms_opt(h, m, 0) else {
            continue;
        };
        if seen.insert(time) {
            out.push(date.and_time(time));
        }
    }
    out
}

/// Advance notice for an entry: user overrides, then defaults, then 30
pub fn lead_minutes(content: &str, overrides: &BTreeMap<String, i64>) -> i64 {
    let lower = content.to_lowercase();
    overrides
        .iter()
        .find(|(k, _)| lower.contains(&k.to_lowercase()))
        .map(|(_, m)| *m)
        .or_else(|| {
            DEFAULT_LEADS
                .iter()
                .find(|(k, _)| lower.contains(k))
                .map(|(_, m)| *m)
        })
        .unwrap_or(DEFAULT_LEAD_MINUTES)
}

fn is_schedule(entry: &KnowledgeEntry) -> bool {
    entry.kind == KnowledgeEntry::SCHEDULE || entry.kind == "日程"
}

/// Render the morning digest
pub fn render_digest(now: NaiveDateTime, occurrences: &[Occurrence]) -> String {
    let mut lines = vec![
        format!("📋 今日日程 - {}", now.format("%Y年%m月%d日 %H:%M")),
        String::new(),
    ];
    if occurrences.is_empty() {
        lines.push("  今日暂无日程安排".to_string());
    } else {
        let mut current: Option<NaiveDate> = None;
        for occ in occurrences {
            let date = occ.at.date();
            if current != Some(date) {
                current = Some(date);
                let weekday = WEEKDAYS[date.weekday().num_days_from_monday() as usize];
                lines.push(format!("\n📅 {}月{}日（{}）", date.month(), date.day(), weekday));
            }
            lines.push(format!("  ⏰ {} - {}", occ.at.format("%H:%M"), occ.title));
        }
    }
    lines.push(String::new());
    lines.push("💡 如有需要设定提前提醒时间的日程，请告诉我具体时间～".to_string());
    lines.join("\n")
}

pub struct ReminderService {
    registry: Arc<Registry>,
    memory: Arc<MemoryStore>,
    store: Arc<dyn DocumentStore>,
    notifications: NotificationService,
    clock: Arc<dyn Clock>,
    ledger: Mutex<ReminderLedger>,
}

impl ReminderService {
    pub async fn open(
        registry: Arc<Registry>,
        memory: Arc<MemoryStore>,
        store: Arc<dyn DocumentStore>,
        notifications: NotificationService,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let ledger = load_typed::<ReminderLedger>(store.as_ref(), keys::REMINDERS)
            .await
            .context("Failed to load reminder ledger")?
            .unwrap_or_default();
        info!(
            "Reminders: {} already reminded, {} lead overrides",
            ledger.reminded.len(),
            ledger.lead_overrides.len()
        );
        Ok(Self {
            registry,
            memory,
            store,
            notifications,
            clock,
            ledger: Mutex::new(ledger),
        })
    }

    fn local_now(&self) -> NaiveDateTime {
        self.clock.now().with_timezone(&Local).naive_local()
    }

    /// Persist a keyword → minutes override
    pub async fn set_lead_override(&self, keyword: &str, minutes: i64) -> Result<()> {
        if keyword.trim().is_empty() || minutes < 0 {
            anyhow::bail!("invalid lead override '{}' = {}", keyword, minutes);
        }
        let mut ledger = self.ledger.lock().await;
        let mut staged = ledger.clone();
        staged
            .lead_overrides
            .insert(keyword.trim().to_string(), minutes);
        save_typed(self.store.as_ref(), keys::REMINDERS, &staged).await?;
        *ledger = staged;
        info!("Reminders: '{}' now gets {} min notice", keyword, minutes);
        Ok(())
    }

    /// Today's and upcoming occurrences across all agents, soonest first
    pub async fn occurrences(&self, now: NaiveDateTime) -> Result<Vec<Occurrence>> {
        let overrides = self.ledger.lock().await.lead_overrides.clone();
        let today = now.date();
        let mut out = Vec::new();

        for agent in self.registry.list().await {
            let knowledge = self
                .memory
                .knowledge(&agent.id)
                .await
                .with_context(|| format!("Failed to read knowledge for {}", agent.id))?;
            for entry in knowledge.iter().filter(|e| is_schedule(e)) {
                let title = entry.content.lines().next().unwrap_or("").trim().to_string();
                let lead = lead_minutes(&entry.content, &overrides);
                for at in parse_occurrence_times(&entry.content) {
                    if at.date() < today {
                        continue;
                    }
                    out.push(Occurrence {
                        agent_id: agent.id.clone(),
                        at,
                        title: title.clone(),
                        lead_minutes: lead,
                    });
                }
            }
        }
        out.sort_by(|a, b| a.at.cmp(&b.at).then(a.agent_id.cmp(&b.agent_id)));
        Ok(out)
    }

    /// Build the daily digest and send it when anything is scheduled.
    /// The text is returned either way.
    pub async fn send_digest(&self) -> Result<String> {
        let now = self.local_now();
        let occurrences = self.occurrences(now).await?;
        let digest = render_digest(now, &occurrences);
        if occurrences.is_empty() {
            debug!("Reminders: nothing scheduled, digest not sent");
            return Ok(digest);
        }
        self.notifications
            .notify(NotifyEvent::ScheduleDigest {
                digest: digest.clone(),
            })
            .await;
        info!("Reminders: sent digest with {} occurrences", occurrences.len());
        Ok(digest)
    }

    /// Send reminders that are due at `now`. Returns the messages sent.
    pub async fn check_reminders(&self, now: NaiveDateTime) -> Result<Vec<String>> {
        let occurrences = self.occurrences(now).await?;
        let mut ledger = self.ledger.lock().await;
        let mut staged = ledger.clone();
        let mut messages = Vec::new();

        // Occurrences before today are never looked at again
        let today = now.date();
        staged
            .reminded
            .retain(|key| key_date(key).is_none_or(|date| date >= today));

        for occ in occurrences {
            let key = occ.key();
            if staged.reminded.contains(&key) {
                continue;
            }
            let remind_at = occ.at - chrono::Duration::minutes(occ.lead_minutes);
            if now < remind_at {
                continue;
            }

            let minutes_until = (occ.at - now).num_minutes();
            if minutes_until < -MISSED_GRACE_MINUTES {
                debug!("Reminders: {} was missed, not reminding", key);
                staged.reminded.insert(key);
                continue;
            }
            let message = if minutes_until <= 0 {
                format!("⏰ 现在开始：{}", occ.title)
            } else {
                format!("⏰ 即将开始（{}分钟后）：{}", minutes_until, occ.title)
            };
            staged.reminded.insert(key);
            messages.push(message);
        }

        if staged.reminded != ledger.reminded {
            save_typed(self.store.as_ref(), keys::REMINDERS, &staged)
                .await
                .context("Failed to save reminder ledger")?;
            *ledger = staged;
        }
        drop(ledger);

        for message in &messages {
            self.notifications
                .notify(NotifyEvent::ScheduleReminder {
                    message: message.clone(),
                })
                .await;
        }
        if !messages.is_empty() {
            info!("Reminders: sent {} reminders", messages.len());
        }
        Ok(messages)
    }

    /// Run the reminder poll and the cron-driven digest until `shutdown` fires
    pub fn spawn(
        self: Arc<Self>,
        digest_cron: &str,
        poll_interval: Duration,
        shutdown: CancellationToken,
    ) -> Result<JoinHandle<()>> {
        let schedule = cron::Schedule::from_str(digest_cron)
            .with_context(|| format!("Invalid cron expression: {}", digest_cron))?;
        let cron_expr = digest_cron.to_string();

        Ok(tokio::spawn(async move {
            info!("Reminder loop started (digest: {})", cron_expr);
            let mut interval = tokio::time::interval(poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            let Some(mut next) = schedule.after(&self.clock.now().with_timezone(&Local)).next()
            else {
                error!("No next occurrence for cron expression {}", cron_expr);
                return;
            };

            loop {
                let wait = until(next, self.clock.now().with_timezone(&Local));
                debug!("Next digest at {} (in {:?})", next, wait);

                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => {
                        info!("Reminder loop stopped");
                        break;
                    }
                    _ = tokio::time::sleep(wait) => {
                        if let Err(e) = self.send_digest().await {
                            warn!("Daily digest failed: {:#}", e);
                        }
                        let handled_at = self.clock.now().with_timezone(&Local);
                        let Some(after) = next_deadline(&schedule, next, handled_at) else {
                            error!("No next occurrence for cron expression {}", cron_expr);
                            break;
                        };
                        next = after;
                    }
                    _ = interval.tick() => {
                        if let Err(e) = self.check_reminders(self.local_now()).await {
                            warn!("Reminder check failed: {:#}", e);
                        }
                    }
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use muster_core::clock::ManualClock;
    use muster_core::notifications::NotifyConfig;
    use muster_core::types::AgentDefinition;
    use muster_knowledge::InMemoryStore;
    use tokio::sync::mpsc;

    fn dt(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M").unwrap()
    }

    struct Fixture {
        store: Arc<InMemoryStore>,
        registry: Arc<Registry>,
        memory: Arc<MemoryStore>,
        service: ReminderService,
        rx: mpsc::Receiver<String>,
    }

    async fn fixture() -> Fixture {
        let now = Local.with_ymd_and_hms(2026, 3, 1, 7, 0, 0).unwrap();
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(now.to_utc()));
        let store = Arc::new(InMemoryStore::new());
        let registry = Arc::new(Registry::open(store.clone()).await.unwrap());
        registry
            .add_agent(AgentDefinition::new("001", "秘书", vec!["小秘".into()]))
            .await
            .unwrap();
        let memory = Arc::new(MemoryStore::new(store.clone(), clock.clone()));
        let (tx, rx) = mpsc::channel(64);
        let svc = NotificationService::new(NotifyConfig::default(), clock.clone(), tx);
        let service = ReminderService::open(
            registry.clone(),
            memory.clone(),
            store.clone(),
            svc,
            clock,
        )
        .await
        .unwrap();
        Fixture {
            store,
            registry,
            memory,
            service,
            rx,
        }
    }

    #[test]
    fn test_parse_occurrence_times() {
        let times = parse_occurrence_times("2026年3月1日 家长会\n9:00-10:30 开会，之后 9:00 复盘");
        assert_eq!(times, vec![dt("2026-03-01 09:00"), dt("2026-03-01 10:30")]);
        assert!(parse_occurrence_times("明天 09:00 开会").is_empty());
        assert!(parse_occurrence_times("2026年2月30日 09:00").is_empty());
        assert_eq!(
            parse_occurrence_times("2026年12月5日 14：00 上课"),
            vec![dt("2026-12-05 14:00")]
        );
    }

    #[test]
    fn test_lead_minutes() {
        let none = BTreeMap::new();
        assert_eq!(lead_minutes("去机场接人", &none), 240);
        assert_eq!(lead_minutes("3点接小朋友", &none), 25);
        assert_eq!(lead_minutes("开会", &none), 15);
        assert_eq!(lead_minutes("吃饭", &none), DEFAULT_LEAD_MINUTES);

        let mut overrides = BTreeMap::new();
        overrides.insert("机场".to_string(), 120);
        assert_eq!(lead_minutes("去机场", &overrides), 120);
    }

    #[test]
    fn test_render_digest() {
        let occ = vec![
            Occurrence {
                agent_id: "001".into(),
                at: dt("2026-03-01 09:00"),
                title: "2026年3月1日 开会".into(),
                lead_minutes: 15,
            },
            Occurrence {
                agent_id: "001".into(),
                at: dt("2026-03-02 08:00"),
                title: "2026年3月2日 上课".into(),
                lead_minutes: 15,
            },
        ];
        let digest = render_digest(dt("2026-03-01 08:30"), &occ);
        assert!(digest.starts_with("📋 今日日程 - 2026年03月01日 08:30"));
        assert!(digest.contains("📅 3月1日（周日）"));
        assert!(digest.contains("  ⏰ 09:00 - 2026年3月1日 开会"));
        assert!(digest.contains("📅 3月2日（周一）"));

        assert!(render_digest(dt("2026-03-01 08:30"), &[]).contains("今日暂无日程安排"));
    }

    #[tokio::test]
    async fn test_reminder_fires_once_within_lead() {
        let mut f = fixture().await;
        f.memory
            .add_knowledge("001", "schedule", "2026年3月1日 09:00 开会")
            .await
            .unwrap();
        f.memory
            .add_knowledge("001", "note", "2026年3月1日 09:00 not a schedule")
            .await
            .unwrap();

        assert!(f.service.check_reminders(dt("2026-03-01 08:40")).await.unwrap().is_empty());

        let sent = f.service.check_reminders(dt("2026-03-01 08:46")).await.unwrap();
        assert_eq!(sent, vec!["⏰ 即将开始（14分钟后）：2026年3月1日 09:00 开会"]);
        assert_eq!(f.rx.try_recv().unwrap(), sent[0]);

        assert!(f.service.check_reminders(dt("2026-03-01 08:50")).await.unwrap().is_empty());
        assert!(f.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_ledger_persists_across_reopen() {
        let f = fixture().await;
        f.memory
            .add_knowledge("001", "日程", "2026年3月1日 09:00 开会")
            .await
            .unwrap();
        let sent = f.service.check_reminders(dt("2026-03-01 09:00")).await.unwrap();
        assert_eq!(sent, vec!["⏰ 现在开始：2026年3月1日 09:00 开会"]);

        let (tx, _rx) = mpsc::channel(8);
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(chrono::Utc::now()));
        let reopened = ReminderService::open(
            f.registry.clone(),
            f.memory.clone(),
            f.store.clone(),
            NotificationService::new(NotifyConfig::default(), clock.clone(), tx),
            clock,
        )
        .await
        .unwrap();
        assert!(reopened.check_reminders(dt("2026-03-01 09:01")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missed_occurrence_is_skipped() {
        let f = fixture().await;
        f.memory
            .add_knowledge("001", "schedule", "2026年3月1日 09:00 开会")
            .await
            .unwrap();
        assert!(f.service.check_reminders(dt("2026-03-01 12:00")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_override_changes_lead() {
        let f = fixture().await;
        f.service.set_lead_override("开会", 60).await.unwrap();
        f.memory
            .add_knowledge("001", "schedule", "2026年3月1日 09:00 开会")
            .await
            .unwrap();
        let occ = f.service.occurrences(dt("2026-03-01 07:00")).await.unwrap();
        assert_eq!(occ[0].lead_minutes, 60);
        assert_eq!(f.service.check_reminders(dt("2026-03-01 08:01")).await.unwrap().len(), 1);
        assert!(f.service.set_lead_override(" ", 5).await.is_err());
    }

    #[tokio::test]
    async fn test_past_dates_excluded_and_digest_sent() {
        let mut f = fixture().await;
        f.memory
            .add_knowledge("001", "schedule", "2026年2月1日 09:00 旧会议")
            .await
            .unwrap();
        f.memory
            .add_knowledge("001", "schedule", "2026年3月1日 10:00 上课")
            .await
            .unwrap();

        let occ = f.service.occurrences(dt("2026-03-01 07:00")).await.unwrap();
        assert_eq!(occ.len(), 1);

        let digest = f.service.send_digest().await.unwrap();
        assert!(digest.contains("10:00 - 2026年3月1日 10:00 上课"));
        assert!(!digest.contains("旧会议"));
        assert_eq!(f.rx.try_recv().unwrap(), digest);
    }

    #[tokio::test]
    async fn test_empty_digest_not_sent() {
        let mut f = fixture().await;
        let digest = f.service.send_digest().await.unwrap();
        assert!(digest.contains("今日暂无日程安排"));
        assert!(f.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_ledger_drops_keys_from_past_days() {
        let f = fixture().await;
        f.memory
            .add_knowledge("001", "schedule", "2026年3月1日 09:00 开会")
            .await
            .unwrap();
        f.memory
            .add_knowledge("001", "schedule", "2026年3月2日 09:00 上课")
            .await
            .unwrap();
        f.service.check_reminders(dt("2026-03-01 09:00")).await.unwrap();
        assert!(f.service.ledger.lock().await.reminded.contains("001@2026-03-01T09:00"));

        f.service.check_reminders(dt("2026-03-02 08:50")).await.unwrap();
        let reminded = f.service.ledger.lock().await.reminded.clone();
        assert!(!reminded.contains("001@2026-03-01T09:00"));
        assert!(reminded.contains("001@2026-03-02T09:00"));

        let stored = load_typed::<ReminderLedger>(f.store.as_ref(), keys::REMINDERS)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.reminded, reminded);
    }

    #[test]
    fn test_key_date() {
        assert_eq!(
            key_date("001@2026-03-01T09:00"),
            NaiveDate::from_ymd_opt(2026, 3, 1)
        );
        assert_eq!(key_date("a@b@2026-03-01T09:00"), NaiveDate::from_ymd_opt(2026, 3, 1));
        assert!(key_date("garbage").is_none());
    }

    #[test]
    fn test_passed_digest_deadline_is_kept_until_sent() {
        let schedule = cron::Schedule::from_str(DEFAULT_DIGEST_CRON).unwrap();
        let deadline = Local.with_ymd_and_hms(2026, 3, 1, 8, 30, 0).unwrap();

        // A reminder check ran past the deadline: it is due now, not tomorrow
        let late = Local.with_ymd_and_hms(2026, 3, 1, 8, 30, 5).unwrap();
        assert_eq!(until(deadline, late), Duration::ZERO);
        assert_eq!(
            until(deadline, deadline - chrono::Duration::minutes(1)),
            Duration::from_secs(60)
        );

        // After sending, the following deadline is the next morning
        let next = next_deadline(&schedule, deadline, late).unwrap();
        assert_eq!(next, Local.with_ymd_and_hms(2026, 3, 2, 8, 30, 0).unwrap());

        // Sending days late does not replay the missed mornings
        let much_later = Local.with_ymd_and_hms(2026, 3, 4, 12, 0, 0).unwrap();
        let next = next_deadline(&schedule, deadline, much_later).unwrap();
        assert_eq!(next, Local.with_ymd_and_hms(2026, 3, 5, 8, 30, 0).unwrap());
    }

    #[tokio::test]
    async fn test_spawn_rejects_bad_cron_and_stops_on_cancel() {
        let f = fixture().await;
        let service = Arc::new(f.service);
        assert!(
            service
                .clone()
                .spawn("not a cron", Duration::from_secs(60), CancellationToken::new())
                .is_err()
        );

        let shutdown = CancellationToken::new();
        let handle = service
            .spawn(DEFAULT_DIGEST_CRON, Duration::from_secs(60), shutdown.clone())
            .unwrap();
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
