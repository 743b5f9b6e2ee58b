use crate::step::StepId;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Errors produced by the generation pipeline and its components.
#[derive(Error, Debug)]
pub enum GenerationError {
    /// The step id has no registered definition.
    #[error("no step definition registered for '{0}'")]
    UnknownStep(StepId),

    /// A step's prompt needs an earlier step's output that the context lacks.
    #[error("step '{step}' requires the output of '{missing}', which is not in the context")]
    MissingDependency { step: StepId, missing: StepId },

    /// Network, DNS or connection failure, or a stream that ended early.
    #[error("transport error: {0}")]
    Transport(String),

    /// Missing or rejected provider credential.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Non-success response carrying a provider-supplied message.
    ///
    /// `retry_after` is populated from the `Retry-After` header when present.
    #[error("provider error{}: {message}", .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    Provider {
        status: Option<u16>,
        message: String,
        retry_after: Option<Duration>,
    },

    /// A single completion attempt exceeded its timeout.
    #[error("completion attempt timed out after {0:?}")]
    Timeout(Duration),

    /// Every attempt allowed by the resilience policy failed.
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<GenerationError>,
    },

    /// None of the extraction strategies produced JSON.
    ///
    /// The raw model text is kept for diagnostics but is not part of the
    /// display message.
    #[error("model response could not be parsed as JSON ({} chars)", .raw.len())]
    UnparsableResponse { raw: String },

    /// A required field is missing and has no registered default.
    #[error("response is missing required field '{path}'")]
    ContractViolation { path: String },

    /// The caller cancelled the run.
    #[error("generation was cancelled")]
    Cancelled,

    /// No run with this id is registered with the service.
    #[error("no run with id {0}")]
    UnknownRun(uuid::Uuid),

    /// Invalid configuration detected at build or load time.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// JSON (de)serialization failed at the serde level.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Serializable classification of a [`GenerationError`].
///
/// Stored on every failed [`StepResult`](crate::executor::StepResult) so callers
/// can distinguish "bad key" from "provider hiccup" without string matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnknownStep,
    MissingDependency,
    Transport,
    Auth,
    Provider,
    Timeout,
    UnparsableResponse,
    ContractViolation,
    Cancelled,
    UnknownRun,
    InvalidConfig,
    Json,
}

impl GenerationError {
    /// Classify this error. Exhausted retries report the kind of the last failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            GenerationError::UnknownStep(_) => ErrorKind::UnknownStep,
            GenerationError::MissingDependency { .. } => ErrorKind::MissingDependency,
            GenerationError::Transport(_) => ErrorKind::Transport,
            GenerationError::Auth(_) => ErrorKind::Auth,
            GenerationError::Provider { .. } => ErrorKind::Provider,
            GenerationError::Timeout(_) => ErrorKind::Timeout,
            GenerationError::RetriesExhausted { last, .. } => last.kind(),
            GenerationError::UnparsableResponse { .. } => ErrorKind::UnparsableResponse,
            GenerationError::ContractViolation { .. } => ErrorKind::ContractViolation,
            GenerationError::Cancelled => ErrorKind::Cancelled,
            GenerationError::UnknownRun(_) => ErrorKind::UnknownRun,
            GenerationError::InvalidConfig(_) => ErrorKind::InvalidConfig,
            GenerationError::Json(_) => ErrorKind::Json,
        }
    }

    /// Whether the resilience wrapper may retry after this error.
    ///
    /// Provider 4xx responses are client/validation failures and are not
    /// retried, except 408, 409, 425 and 429.
    pub fn is_retryable(&self) -> bool {
        match self {
            GenerationError::Transport(_) | GenerationError::Timeout(_) => true,
            GenerationError::Provider { status, .. } => match status {
                Some(s) if (400..500).contains(s) => matches!(*s, 408 | 409 | 425 | 429),
                _ => true,
            },
            _ => false,
        }
    }

    /// Whether this error (or the last error behind exhausted retries) is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }

    /// Raw model text, for unparsable responses.
    pub fn raw_response(&self) -> Option<&str> {
        match self {
            GenerationError::UnparsableResponse { raw } => Some(raw),
            GenerationError::RetriesExhausted { last, .. } => last.raw_response(),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for GenerationError {
    fn from(err: reqwest::Error) -> Self {
        GenerationError::Transport(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GenerationError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(status: u16) -> GenerationError {
        GenerationError::Provider {
            status: Some(status),
            message: "boom".into(),
            retry_after: None,
        }
    }

    #[test]
    fn test_transient_errors_are_retryable() {
        assert!(GenerationError::Transport("reset".into()).is_retryable());
        assert!(GenerationError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(provider(500).is_retryable());
        assert!(provider(503).is_retryable());
        assert!(provider(429).is_retryable());
    }

    #[test]
    fn test_client_errors_are_not_retryable() {
        assert!(!provider(400).is_retryable());
        assert!(!provider(422).is_retryable());
        assert!(!GenerationError::Auth("bad key".into()).is_retryable());
        assert!(!GenerationError::Cancelled.is_retryable());
        assert!(!GenerationError::ContractViolation { path: "a".into() }.is_retryable());
    }

    #[test]
    fn test_exhausted_reports_last_kind() {
        let err = GenerationError::RetriesExhausted {
            attempts: 4,
            last: Box::new(GenerationError::Transport("refused".into())),
        };
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(err.to_string().contains("4 attempts"));
    }

    #[test]
    fn test_unparsable_display_hides_raw_text() {
        let err = GenerationError::UnparsableResponse {
            raw: "secret model ramble".into(),
        };
        assert!(!err.to_string().contains("secret"));
        assert_eq!(err.raw_response(), Some("secret model ramble"));
    }

    #[test]
    fn test_provider_display_includes_status() {
        assert_eq!(provider(502).to_string(), "provider error (HTTP 502): boom");
        let no_status = GenerationError::Provider {
            status: None,
            message: "overloaded".into(),
            retry_after: None,
        };
        assert_eq!(no_status.to_string(), "provider error: overloaded");
    }

    #[test]
    fn test_error_kind_serializes_snake_case() {
        let s = serde_json::to_string(&ErrorKind::ContractViolation).unwrap();
        assert_eq!(s, "\"contract_violation\"");
    }
}
