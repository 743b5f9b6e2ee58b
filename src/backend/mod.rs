//! Completion client: backend trait and normalized request/response types.
//!
//! The [`Backend`] trait abstracts over chat-completion providers, translating
//! a normalized [`CompletionRequest`] into the provider's HTTP API and the
//! reply into a [`Completion`] with token usage. Built-in implementations:
//! [`OpenAiBackend`] for OpenRouter and any OpenAI-compatible endpoint, and
//! [`MockBackend`] for scripted tests.
//!
//! ## Architecture
//!
//! ```text
//! StepExecutor ──► CompletionRequest ──► Backend::complete()           ──► Completion
//!                                        Backend::complete_streaming()       (text + usage)
//!                                                 │
//!                                   ┌─────────────┴─────────────┐
//!                              OpenAiBackend                MockBackend
//!                          /v1/chat/completions           scripted outcomes
//!                          SSE `data:` frames
//! ```
//!
//! Timeouts, retries and cancellation are applied around these calls by
//! [`with_resilience`](crate::resilience::with_resilience); dropping an
//! in-flight future aborts the underlying request.

pub mod mock;
pub mod openai;
pub mod sse;

pub use mock::{MockBackend, MockReply};
pub use openai::OpenAiBackend;

use crate::error::Result;
use crate::usage::TokenUsage;
use async_trait::async_trait;
use serde::Serialize;

/// Token callback for streaming calls: `(delta, accumulated_text)`.
pub type TokenSink<'a> = &'a mut (dyn FnMut(&str, &str) + Send);

/// A normalized completion request.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    /// Model identifier (e.g. `"openai/gpt-4o-mini"`).
    pub model: String,
    pub system_prompt: String,
    pub user_prompt: String,
    /// Sampling temperature in `[0, 2]`.
    pub temperature: f64,
    /// Maximum output tokens.
    pub max_tokens: u32,
    /// Ask the provider for a JSON object response format.
    pub json_mode: bool,
}

impl CompletionRequest {
    /// The chat messages sent to the provider: system (if non-empty) then user.
    pub fn messages(&self) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(2);
        if !self.system_prompt.is_empty() {
            messages.push(ChatMessage {
                role: Role::System,
                content: self.system_prompt.clone(),
            });
        }
        messages.push(ChatMessage {
            role: Role::User,
            content: self.user_prompt.clone(),
        });
        messages
    }
}

/// A single message in a chat conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

/// The role of a chat message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A finished completion.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    /// The full generated text.
    pub text: String,
    pub usage: TokenUsage,
    /// Model reported by the provider, if it differs from or refines the request.
    pub model: Option<String>,
}

/// Abstraction over chat-completion providers.
///
/// # Object Safety
///
/// This trait is object-safe and designed to be used as `Arc<dyn Backend>`.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Execute a buffered completion.
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion>;

    /// Execute a streamed completion.
    ///
    /// `on_token` is called once per non-empty delta, in arrival order, with
    /// the delta and the text accumulated so far. The final aggregate is
    /// returned once the stream's completion sentinel arrives.
    async fn complete_streaming(
        &self,
        request: &CompletionRequest,
        on_token: TokenSink<'_>,
    ) -> Result<Completion>;

    /// Human-readable name for logging and diagnostics.
    fn name(&self) -> &'static str;
}
