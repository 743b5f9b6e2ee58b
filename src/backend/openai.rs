//! Backend for OpenRouter and other OpenAI-compatible APIs.
//!
//! Endpoint: `{base}/chat/completions` where `base` ends in `/v1`.
//! Streaming: SSE with `data: {"choices": [{"delta": {"content": "token"}}]}`,
//! terminated by `data: [DONE]`.

use super::sse::collect_stream;
use super::{Backend, ChatMessage, Completion, CompletionRequest, TokenSink};
use crate::error::{GenerationError, Result};
use crate::usage::TokenUsage;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, instrument};

/// Default OpenRouter API root.
pub const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// Backend for any OpenAI-compatible chat-completions API.
///
/// # Example
///
/// ```
/// use webgen_pipeline::backend::OpenAiBackend;
///
/// let backend = OpenAiBackend::openrouter().with_api_key("sk-or-...");
/// assert!(backend.has_api_key());
/// assert_eq!(backend.endpoint(), "https://openrouter.ai/api/v1/chat/completions");
/// ```
#[derive(Clone)]
pub struct OpenAiBackend {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    /// Sent as `HTTP-Referer` (OpenRouter app attribution).
    referer: Option<String>,
    /// Sent as `X-Title`.
    title: Option<String>,
}

impl std::fmt::Debug for OpenAiBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiBackend")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_deref().map(redact))
            .field("referer", &self.referer)
            .field("title", &self.title)
            .finish()
    }
}

fn redact(key: &str) -> String {
    match key.char_indices().nth(6) {
        Some((idx, _)) => format!("{}***", &key[..idx]),
        None => "***".to_string(),
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f64,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct StreamOptions {
    include_usage: bool,
}

impl OpenAiBackend {
    /// Backend for an OpenAI-compatible server at `base_url`.
    ///
    /// The URL is normalised: a trailing `/chat/completions` is removed and
    /// `/v1` is appended when missing.
    pub fn new(base_url: impl AsRef<str>) -> Self {
        Self {
            client: Client::new(),
            base_url: normalize_base_url(base_url.as_ref()),
            api_key: None,
            referer: None,
            title: None,
        }
    }

    pub fn openrouter() -> Self {
        Self::new(OPENROUTER_BASE_URL)
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Read the API key from an environment variable. A missing or empty
    /// variable leaves the backend without a key.
    pub fn with_api_key_from_env(mut self, var: &str) -> Self {
        self.api_key = std::env::var(var).ok().filter(|k| !k.trim().is_empty());
        self
    }

    /// Attribution headers shown on the OpenRouter dashboard.
    pub fn with_app_headers(mut self, referer: Option<String>, title: Option<String>) -> Self {
        self.referer = referer;
        self.title = title;
        self
    }

    /// Use a preconfigured HTTP client (proxies, pools, TLS settings).
    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn build_body(request: &CompletionRequest, stream: bool) -> ChatRequest<'_> {
        ChatRequest {
            model: &request.model,
            messages: request.messages(),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream,
            response_format: request
                .json_mode
                .then_some(ResponseFormat { kind: "json_object" }),
            stream_options: stream.then_some(StreamOptions {
                include_usage: true,
            }),
        }
    }

    fn build_http_request(&self, body: &ChatRequest<'_>) -> Result<reqwest::RequestBuilder> {
        let key = self
            .api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| GenerationError::Auth("no API key configured".into()))?;

        let mut req = self
            .client
            .post(self.endpoint())
            .bearer_auth(key)
            .json(body);
        if let Some(ref referer) = self.referer {
            req = req.header("HTTP-Referer", referer.as_str());
        }
        if let Some(ref title) = self.title {
            req = req.header("X-Title", title.as_str());
        }
        Ok(req)
    }

    async fn send(&self, body: &ChatRequest<'_>) -> Result<reqwest::Response> {
        let resp = self
            .build_http_request(body)?
            .send()
            .await
            .map_err(|e| {
                GenerationError::Transport(format!(
                    "failed to reach {}: {}",
                    self.endpoint(),
                    e
                ))
            })?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let retry_after = parse_retry_after(resp.headers());
        let text = resp.text().await.unwrap_or_default();
        Err(error_for_status(status, &text, retry_after))
    }
}

/// Map a non-success HTTP response to the error taxonomy.
fn error_for_status(status: StatusCode, body: &str, retry_after: Option<Duration>) -> GenerationError {
    let message = provider_message(body).unwrap_or_else(|| {
        let trimmed = body.trim();
        if trimmed.is_empty() {
            status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_string()
        } else {
            trimmed.chars().take(500).collect()
        }
    });

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => GenerationError::Auth(message),
        _ => GenerationError::Provider {
            status: Some(status.as_u16()),
            message,
            retry_after,
        },
    }
}

/// `error.message` from an OpenAI/OpenRouter error body.
fn provider_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    let error = value.get("error")?;
    error
        .get("message")
        .and_then(Value::as_str)
        .or_else(|| error.as_str())
        .map(str::to_string)
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?;
    let secs: f64 = value.trim().parse().ok()?;
    (secs.is_finite() && secs >= 0.0).then(|| Duration::from_secs_f64(secs))
}

fn normalize_base_url(url: &str) -> String {
    let trimmed = url.trim().trim_end_matches('/');
    let trimmed = trimmed
        .strip_suffix("/chat/completions")
        .unwrap_or(trimmed)
        .trim_end_matches('/');
    if trimmed.ends_with("/v1") {
        trimmed.to_string()
    } else {
        format!("{}/v1", trimmed)
    }
}

/// Parse a buffered chat-completions body.
fn parse_completion(json: &Value, request: &CompletionRequest) -> Result<Completion> {
    // OpenRouter reports some upstream failures as 200 with an error object.
    if let Some(err) = json.get("error") {
        return Err(GenerationError::Provider {
            status: err
                .get("code")
                .and_then(Value::as_u64)
                .and_then(|c| u16::try_from(c).ok()),
            message: err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("provider returned an error")
                .to_string(),
            retry_after: None,
        });
    }

    let text = json
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
        .ok_or_else(|| GenerationError::Provider {
            status: None,
            message: "response has no choices[0].message.content".into(),
            retry_after: None,
        })?
        .to_string();

    let usage = json
        .get("usage")
        .and_then(TokenUsage::from_openai)
        .unwrap_or_else(|| TokenUsage::estimate(&prompt_text(request), &text));

    Ok(Completion {
        text,
        usage,
        model: json
            .get("model")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

fn prompt_text(request: &CompletionRequest) -> String {
    format!("{}{}", request.system_prompt, request.user_prompt)
}

#[async_trait]
impl Backend for OpenAiBackend {
    #[instrument(skip_all, fields(provider = "openai", model = %request.model))]
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let start = Instant::now();
        debug!(
            max_tokens = request.max_tokens,
            temperature = request.temperature,
            "Sending completion request"
        );

        let body = Self::build_body(request, false);
        let resp = self.send(&body).await?;
        let json: Value = resp
            .json()
            .await
            .map_err(|e| GenerationError::Transport(format!("failed to read response body: {}", e)))?;
        let completion = parse_completion(&json, request)?;

        debug!(
            duration_ms = start.elapsed().as_millis() as u64,
            tokens = completion.usage.total,
            "Completion received"
        );
        Ok(completion)
    }

    #[instrument(skip_all, fields(provider = "openai", model = %request.model))]
    async fn complete_streaming(
        &self,
        request: &CompletionRequest,
        on_token: TokenSink<'_>,
    ) -> Result<Completion> {
        let start = Instant::now();
        debug!(max_tokens = request.max_tokens, "Opening completion stream");

        let body = Self::build_body(request, true);
        let resp = self.send(&body).await?;
        let streamed = collect_stream(resp.bytes_stream(), on_token).await?;

        let usage = match streamed.usage {
            Some(usage) => usage,
            None => {
                debug!("Stream carried no usage frame, estimating");
                TokenUsage::estimate(&prompt_text(request), &streamed.text)
            }
        };
        debug!(
            duration_ms = start.elapsed().as_millis() as u64,
            chars = streamed.text.len(),
            "Stream completed"
        );
        Ok(Completion {
            text: streamed.text,
            usage,
            model: streamed.model,
        })
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}
