//! HTTP completion client for OpenAI-compatible chat endpoints.
//!
//! The default target is a local Ollama server exposing the compatibility
//! surface at `http://localhost:11434/v1`; any endpoint speaking the same
//! `/chat/completions` shape works (hosted OpenAI included, given a key).

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::client::{CompletionClient, CompletionRequest};
use capstan_types::{Result, WorkflowError};

pub const DEFAULT_BASE_URL: &str = "http://localhost:11434/v1";
pub const DEFAULT_MODEL: &str = "llama3.2:1b";

// ---------------------------------------------------------------------------
// LlmConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    /// Bearer token; local Ollama ignores it, hosted endpoints require it.
    pub api_key: Option<String>,
    pub timeout: Duration,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_key: None,
            timeout: Duration::from_secs(120),
        }
    }
}

impl LlmConfig {
    /// Overlay `CAPSTAN_LLM_BASE_URL`, `CAPSTAN_LLM_MODEL` and
    /// `CAPSTAN_LLM_API_KEY` onto the defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("CAPSTAN_LLM_BASE_URL") {
            config.base_url = url;
        }
        if let Ok(model) = std::env::var("CAPSTAN_LLM_MODEL") {
            config.model = model;
        }
        if let Ok(key) = std::env::var("CAPSTAN_LLM_API_KEY") {
            config.api_key = Some(key);
        }
        config
    }
}

// ---------------------------------------------------------------------------
// HttpCompletionClient
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct HttpCompletionClient {
    config: LlmConfig,
    client: reqwest::Client,
}

impl HttpCompletionClient {
    pub fn new(config: LlmConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }

    fn build_body(&self, request: &CompletionRequest) -> serde_json::Value {
        let mut messages = Vec::new();
        if let Some(ref system) = request.system {
            messages.push(json!({ "role": "system", "content": system }));
        }
        messages.push(json!({ "role": "user", "content": request.prompt }));

        let mut body = json!({
            "model": self.config.model,
            "messages": messages,
        });
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        body
    }

    fn map_transport_error(&self, err: reqwest::Error) -> WorkflowError {
        if err.is_timeout() {
            WorkflowError::UpstreamTimeout {
                endpoint: self.endpoint(),
                timeout_ms: self.config.timeout.as_millis() as u64,
            }
        } else {
            WorkflowError::UpstreamUnavailable {
                endpoint: self.endpoint(),
                message: err.to_string(),
            }
        }
    }
}

impl Default for HttpCompletionClient {
    fn default() -> Self {
        Self::new(LlmConfig::default())
    }
}

#[async_trait]
impl CompletionClient for HttpCompletionClient {
    async fn complete(&self, request: CompletionRequest) -> Result<String> {
        let endpoint = self.endpoint();
        let body = self.build_body(&request);
        tracing::debug!(%endpoint, model = %self.config.model, "sending completion request");

        let mut builder = self
            .client
            .post(&endpoint)
            .timeout(self.config.timeout)
            .json(&body);
        if let Some(ref key) = self.config.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(WorkflowError::UpstreamUnavailable {
                endpoint,
                message: format!("HTTP {status}: {detail}"),
            });
        }

        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        let text = payload["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| WorkflowError::UpstreamUnavailable {
                endpoint,
                message: "response carried no message content".into(),
            })?;

        tracing::debug!(chars = text.len(), "completion received");
        Ok(text.to_string())
    }
}
