//! Mock backend for testing without a live provider.
//!
//! [`MockBackend`] plays back a script of [`MockReply`] values in order,
//! allowing deterministic tests of retry, streaming and cancellation paths.
//!
//! # Example
//!
//! ```
//! use webgen_pipeline::backend::{MockBackend, MockReply};
//!
//! let mock = MockBackend::new(vec![
//!     MockReply::provider(503, "overloaded"),
//!     MockReply::text(r#"{"sitemap": ["home"], "pages": []}"#),
//! ]);
//! assert_eq!(mock.calls(), 0);
//! ```

use super::{Backend, Completion, CompletionRequest, TokenSink};
use crate::error::{GenerationError, Result};
use crate::usage::TokenUsage;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// One scripted outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum MockReply {
    /// Succeed with this text.
    Text(String),
    /// Fail with [`GenerationError::Transport`].
    Transport(String),
    /// Fail with [`GenerationError::Auth`].
    Auth(String),
    /// Fail with [`GenerationError::Provider`].
    Provider { status: u16, message: String },
    /// Never resolve. Exercises timeouts and cancellation.
    Hang,
}

impl MockReply {
    pub fn text(text: impl Into<String>) -> Self {
        MockReply::Text(text.into())
    }

    pub fn json(value: &serde_json::Value) -> Self {
        MockReply::Text(value.to_string())
    }

    pub fn transport(message: impl Into<String>) -> Self {
        MockReply::Transport(message.into())
    }

    pub fn auth(message: impl Into<String>) -> Self {
        MockReply::Auth(message.into())
    }

    pub fn provider(status: u16, message: impl Into<String>) -> Self {
        MockReply::Provider {
            status,
            message: message.into(),
        }
    }
}

/// A scripted test backend.
///
/// Replies are consumed in order; the last reply repeats once the script is
/// exhausted. Streaming splits text replies into fixed-size chunks.
#[derive(Debug)]
pub struct MockBackend {
    script: Mutex<VecDeque<MockReply>>,
    requests: Mutex<Vec<CompletionRequest>>,
    calls: AtomicUsize,
    delay: Duration,
    chunk_chars: usize,
}

impl MockBackend {
    /// Create a mock with the given script.
    ///
    /// An empty script behaves like a single `Transport` failure.
    pub fn new(script: Vec<MockReply>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
            chunk_chars: 8,
        }
    }

    /// A mock that always returns the same text.
    pub fn fixed(text: impl Into<String>) -> Self {
        Self::new(vec![MockReply::text(text)])
    }

    /// Sleep this long before every reply (and between streamed chunks).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Characters per streamed chunk. Zero is treated as one.
    pub fn with_chunk_chars(mut self, chars: usize) -> Self {
        self.chunk_chars = chars.max(1);
        self
    }

    /// Number of completion calls made so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every request received, in call order.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        match self.requests.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn next_reply(&self, request: &CompletionRequest) -> MockReply {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.requests.lock() {
            Ok(mut guard) => guard.push(request.clone()),
            Err(poisoned) => poisoned.into_inner().push(request.clone()),
        }
        let mut script = match self.script.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if script.len() > 1 {
            script.pop_front().unwrap_or(MockReply::Hang)
        } else {
            script
                .front()
                .cloned()
                .unwrap_or_else(|| MockReply::transport("mock script is empty"))
        }
    }

    async fn resolve(&self, request: &CompletionRequest) -> Result<String> {
        let reply = self.next_reply(request);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match reply {
            MockReply::Text(text) => Ok(text),
            MockReply::Transport(message) => Err(GenerationError::Transport(message)),
            MockReply::Auth(message) => Err(GenerationError::Auth(message)),
            MockReply::Provider { status, message } => Err(GenerationError::Provider {
                status: Some(status),
                message,
                retry_after: None,
            }),
            MockReply::Hang => std::future::pending().await,
        }
    }

    fn completion(request: &CompletionRequest, text: String) -> Completion {
        let prompt = format!("{}{}", request.system_prompt, request.user_prompt);
        Completion {
            usage: TokenUsage::estimate(&prompt, &text),
            text,
            model: Some(request.model.clone()),
        }
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let text = self.resolve(request).await?;
        Ok(Self::completion(request, text))
    }

    async fn complete_streaming(
        &self,
        request: &CompletionRequest,
        on_token: TokenSink<'_>,
    ) -> Result<Completion> {
        let text = self.resolve(request).await?;

        let chars: Vec<char> = text.chars().collect();
        let mut accumulated = String::with_capacity(text.len());
        for chunk in chars.chunks(self.chunk_chars) {
            let delta: String = chunk.iter().collect();
            accumulated.push_str(&delta);
            on_token(&delta, &accumulated);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
        }
        Ok(Self::completion(request, text))
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}
