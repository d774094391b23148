//! Conversational engine interface

use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::error::EngineError;

/// Per-call engine options. The model is chosen by the caller, never globally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOptions {
    pub model: Option<String>,
    pub timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            model: None,
            timeout: Duration::from_secs(120),
        }
    }
}

/// Produces a reply for a fully assembled prompt
#[async_trait]
pub trait ConversationEngine: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, prompt: &str, options: &EngineOptions) -> Result<String, EngineError>;
}

/// Call the engine with `options.timeout` enforced regardless of the backend
pub async fn generate_bounded(
    engine: &dyn ConversationEngine,
    prompt: &str,
    options: &EngineOptions,
) -> Result<String, EngineError> {
    match tokio::time::timeout(options.timeout, engine.generate(prompt, options)).await {
        Ok(Ok(reply)) if reply.trim().is_empty() => {
            Err(EngineError::BadResponse("empty reply".into()))
        }
        Ok(result) => result,
        Err(_) => {
            warn!(
                "Engine {} timed out after {:?}",
                engine.name(),
                options.timeout
            );
            Err(EngineError::Timeout(options.timeout.as_secs()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Slow;

    #[async_trait]
    impl ConversationEngine for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        async fn generate(&self, _prompt: &str, _options: &EngineOptions) -> Result<String, EngineError> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok("late".into())
        }
    }

    struct Blank;

    #[async_trait]
    impl ConversationEngine for Blank {
        fn name(&self) -> &str {
            "blank"
        }

        async fn generate(&self, _prompt: &str, _options: &EngineOptions) -> Result<String, EngineError> {
            Ok("  \n".into())
        }
    }

    #[tokio::test]
    async fn test_timeout_enforced() {
        let options = EngineOptions {
            model: None,
            timeout: Duration::from_millis(50),
        };
        assert_eq!(
            generate_bounded(&Slow, "hi", &options).await,
            Err(EngineError::Timeout(0))
        );
    }

    #[tokio::test]
    async fn test_blank_reply_rejected() {
        assert!(matches!(
            generate_bounded(&Blank, "hi", &EngineOptions::default()).await,
            Err(EngineError::BadResponse(_))
        ));
    }
}
