//! muster-scheduler - the periodic side of muster
//!
//! Two background loops, both stopped by a `CancellationToken`:
//! - `TaskMonitor` polls the task table for stuck tasks and sends progress reports
//! - `ReminderService` sends the daily schedule digest and lead-time reminders

pub mod monitor;
pub mod reminders;

pub use monitor::{MonitorConfig, PollOutcome, TaskMonitor};
pub use reminders::{DEFAULT_DIGEST_CRON, Occurrence, ReminderService};
