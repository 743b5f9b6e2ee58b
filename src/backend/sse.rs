//! SSE (Server-Sent Events) decoding for OpenAI-compatible streams.
//!
//! Handles the `data: ` prefix, `[DONE]` termination, line buffering across
//! TCP chunk boundaries, empty keep-alive lines and `:` comment lines (which
//! OpenRouter uses as processing heartbeats).

use super::TokenSink;
use crate::error::{GenerationError, Result};
use crate::usage::TokenUsage;
use futures::{Stream, StreamExt};
use serde_json::Value;
use tracing::debug;

/// One decoded SSE event.
#[derive(Debug, Clone, PartialEq)]
pub enum SseFrame {
    /// A `data: {...}` payload.
    Data(Value),
    /// The `data: [DONE]` completion sentinel.
    Done,
}

/// SSE stream decoder.
///
/// # Example
///
/// ```
/// use webgen_pipeline::backend::sse::{SseDecoder, SseFrame};
///
/// let mut decoder = SseDecoder::new();
/// let data = b"data: {\"choices\":[{\"delta\":{\"content\":\"Hello\"}}]}\n\ndata: [DONE]\n\n";
/// let frames = decoder.decode(data);
/// assert_eq!(frames.len(), 2);
/// assert_eq!(frames[1], SseFrame::Done);
/// ```
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
}

impl SseDecoder {
    /// Create a new empty SSE decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes into the decoder and return any complete frames.
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            if let Some(frame) = parse_line(&line) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Decode whatever is left in the buffer once the transport closes.
    pub fn flush(&mut self) -> Vec<SseFrame> {
        let remaining = std::mem::take(&mut self.buffer);
        remaining.lines().filter_map(parse_line).collect()
    }
}

fn parse_line(line: &str) -> Option<SseFrame> {
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') || line.starts_with("event:") {
        return None;
    }
    let data = line
        .strip_prefix("data: ")
        .or_else(|| line.strip_prefix("data:"))?
        .trim();

    if data == "[DONE]" {
        return Some(SseFrame::Done);
    }
    match serde_json::from_str::<Value>(data) {
        Ok(value) => Some(SseFrame::Data(value)),
        Err(e) => {
            debug!(error = %e, "Skipping malformed SSE data frame");
            None
        }
    }
}

/// Text and metadata gathered from a completed stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamedCompletion {
    pub text: String,
    /// Usage, when the provider sent a usage frame.
    pub usage: Option<TokenUsage>,
    pub model: Option<String>,
}

/// Drive a chunked SSE byte stream to completion.
///
/// Calls `on_token(delta, accumulated)` for each non-empty
/// `choices[0].delta.content` fragment in arrival order. Frames after
/// `[DONE]` are ignored. A stream that closes before `[DONE]` is a
/// [`GenerationError::Transport`]; an `error` object inside a frame is a
/// [`GenerationError::Provider`].
pub async fn collect_stream<S, B, E>(
    stream: S,
    on_token: TokenSink<'_>,
) -> Result<StreamedCompletion>
where
    S: Stream<Item = std::result::Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let mut stream = std::pin::pin!(stream);
    let mut decoder = SseDecoder::new();
    let mut out = StreamedCompletion {
        text: String::new(),
        usage: None,
        model: None,
    };

    while let Some(chunk) = stream.next().await {
        let chunk = chunk
            .map_err(|e| GenerationError::Transport(format!("stream interrupted: {}", e)))?;
        for frame in decoder.decode(chunk.as_ref()) {
            if apply_frame(frame, &mut out, on_token)? {
                return Ok(out);
            }
        }
    }

    for frame in decoder.flush() {
        if apply_frame(frame, &mut out, on_token)? {
            return Ok(out);
        }
    }

    Err(GenerationError::Transport(
        "stream ended without a [DONE] sentinel".into(),
    ))
}

/// Fold one frame into `out`. Returns `true` on the completion sentinel.
fn apply_frame(
    frame: SseFrame,
    out: &mut StreamedCompletion,
    on_token: &mut (dyn FnMut(&str, &str) + Send),
) -> Result<bool> {
    let value = match frame {
        SseFrame::Done => return Ok(true),
        SseFrame::Data(value) => value,
    };

    if let Some(err) = value.get("error") {
        return Err(GenerationError::Provider {
            status: err
                .get("code")
                .and_then(|c| c.as_u64())
                .and_then(|c| u16::try_from(c).ok()),
            message: err
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("stream reported an error")
                .to_string(),
            retry_after: None,
        });
    }

    if out.model.is_none() {
        out.model = value
            .get("model")
            .and_then(|m| m.as_str())
            .map(str::to_string);
    }
    if let Some(usage) = value.get("usage").and_then(TokenUsage::from_openai) {
        out.usage = Some(usage);
    }

    if let Some(delta) = value
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("delta"))
        .and_then(|d| d.get("content"))
        .and_then(|v| v.as_str())
    {
        if !delta.is_empty() {
            out.text.push_str(delta);
            on_token(delta, &out.text);
        }
    }
    Ok(false)
}
