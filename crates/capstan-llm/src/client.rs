//! The completion-client seam.
//!
//! Workflow steps depend on `CompletionClient`, never on a concrete HTTP
//! client, so pipelines can run against a scripted stand-in in tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use capstan_types::{Result, WorkflowError};

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// One completion call: an optional system framing plus the user prompt.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub system: Option<String>,
    pub prompt: String,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

// ---------------------------------------------------------------------------
// CompletionClient
// ---------------------------------------------------------------------------

#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Run one completion and return the model's text.
    async fn complete(&self, request: CompletionRequest) -> Result<String>;
}

// ---------------------------------------------------------------------------
// ScriptedClient
// ---------------------------------------------------------------------------

/// Test double that replays canned responses in order and records every
/// prompt it was given.
#[derive(Debug, Default)]
pub struct ScriptedClient {
    responses: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedClient {
    pub fn new(responses: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().map(Into::into).collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Prompts seen so far, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl CompletionClient for ScriptedClient {
    async fn complete(&self, request: CompletionRequest) -> Result<String> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(request.prompt.clone());
        }
        self.responses
            .lock()
            .ok()
            .and_then(|mut r| r.pop_front())
            .ok_or_else(|| WorkflowError::UpstreamUnavailable {
                endpoint: "scripted".into(),
                message: "script exhausted".into(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_client_replays_in_order_then_fails() {
        let client = ScriptedClient::new(["first", "second"]);

        let a = client.complete(CompletionRequest::new("p1")).await.unwrap();
        let b = client.complete(CompletionRequest::new("p2")).await.unwrap();
        assert_eq!(a, "first");
        assert_eq!(b, "second");
        assert_eq!(client.prompts(), vec!["p1", "p2"]);

        let err = client
            .complete(CompletionRequest::new("p3"))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::UpstreamUnavailable { .. }));
    }
}
