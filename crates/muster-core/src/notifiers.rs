//! Concrete notifier transports

use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{NotifyError, short_diagnostic};
use crate::notifications::Notifier;

/// Writes notifications to the log. Used when no transport is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn notify(&self, message: &str) -> Result<(), NotifyError> {
        info!("[notify] {}", message);
        Ok(())
    }
}

/// Runs an external sender program with the message as its last argument,
/// e.g. `node send_qq.js <message>`.
#[derive(Debug, Clone)]
pub struct CommandNotifier {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandNotifier {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Notifier for CommandNotifier {
    fn name(&self) -> &str {
        &self.program
    }

    async fn notify(&self, message: &str) -> Result<(), NotifyError> {
        debug!("Running notifier command {}", self.program);

        let output = tokio::time::timeout(
            self.timeout,
            Command::new(&self.program)
                .args(&self.args)
                .arg(message)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| NotifyError::Timeout(self.timeout.as_secs()))?
        .map_err(|e| NotifyError::Failed(short_diagnostic(&e.to_string())))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let diag = if stderr.trim().is_empty() {
                format!("exited with {}", output.status)
            } else {
                short_diagnostic(&stderr)
            };
            return Err(NotifyError::Failed(diag));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_log_notifier_always_succeeds() {
        assert!(LogNotifier.notify("hello").await.is_ok());
    }

    #[tokio::test]
    async fn test_missing_program_fails() {
        let notifier = CommandNotifier::new("/nonexistent/muster-sender", vec![]);
        assert!(matches!(
            notifier.notify("hi").await,
            Err(NotifyError::Failed(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_receives_message_and_reports_exit() {
        let ok = CommandNotifier::new("sh", vec!["-c".into(), "test \"$0\" = hi".into()]);
        assert!(ok.notify("hi").await.is_ok());
        assert!(matches!(
            ok.notify("bye").await,
            Err(NotifyError::Failed(msg)) if msg.contains("exit")
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_timeout() {
        let slow = CommandNotifier::new("sh", vec!["-c".into(), "sleep 5".into()])
            .with_timeout(Duration::from_millis(100));
        assert!(matches!(
            slow.notify("x").await,
            Err(NotifyError::Timeout(_))
        ));
    }
}
