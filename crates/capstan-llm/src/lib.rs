//! Language-model access for Capstan workflow steps.
//!
//! One trait, two implementations: `HttpCompletionClient` speaks the
//! OpenAI-compatible `/chat/completions` surface (local Ollama by default),
//! and `ScriptedClient` replays canned answers for tests and demos.

pub mod client;
pub mod http;

pub use client::{CompletionClient, CompletionRequest, ScriptedClient};
pub use http::{HttpCompletionClient, LlmConfig, DEFAULT_BASE_URL, DEFAULT_MODEL};
