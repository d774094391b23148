//! Ollama engine using the native `/api/generate` endpoint

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::engine::{ConversationEngine, EngineOptions};
use crate::error::{EngineError, short_diagnostic};

pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";
pub const DEFAULT_MODEL: &str = "qwen2:0.5b";

#[derive(Clone)]
pub struct OllamaEngine {
    client: Client,
    base_url: String,
    default_model: String,
    api_key: Option<String>,
}

impl std::fmt::Debug for OllamaEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OllamaEngine")
            .field("client", &"<reqwest::Client>")
            .field("base_url", &self.base_url)
            .field("default_model", &self.default_model)
            .field("api_key", &self.api_key.as_ref().map(|_| "<set>"))
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

impl OllamaEngine {
    pub fn new(base_url: impl Into<String>, default_model: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            default_model: default_model.into(),
            api_key: None,
        })
    }

    /// Send a bearer token, for instances behind an authenticating proxy
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        let key = api_key.into();
        self.api_key = (!key.is_empty()).then_some(key);
        self
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    fn endpoint(&self) -> String {
        format!("{}/api/generate", self.base_url)
    }
}

#[async_trait]
impl ConversationEngine for OllamaEngine {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn generate(&self, prompt: &str, options: &EngineOptions) -> Result<String, EngineError> {
        let model = options.model.as_deref().unwrap_or(&self.default_model);
        let body = serde_json::json!({
            "model": model,
            "prompt": prompt,
            "stream": false,
        });

        debug!(
            "Sending {} char prompt to Ollama model {}",
            prompt.chars().count(),
            model
        );

        let mut request = self.client.post(self.endpoint()).timeout(options.timeout);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EngineError::Timeout(options.timeout.as_secs())
                } else {
                    EngineError::Unavailable(short_diagnostic(&e.to_string()))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(EngineError::Unavailable(short_diagnostic(&format!(
                "HTTP {}: {}",
                status, error_text
            ))));
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| EngineError::BadResponse(short_diagnostic(&e.to_string())))?;

        Ok(parsed.response.trim().to_string())
    }
}
