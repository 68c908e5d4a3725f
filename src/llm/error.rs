use std::fmt;

use thiserror::Error;

/// Broad category of an LLM call failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmErrorKind {
    /// 429 from the provider
    RateLimited,
    /// 5xx, connection resets, timeouts
    Transient,
    /// Bad credentials or missing access to the model
    Auth,
    /// Request rejected as malformed (includes broken tool-call payloads)
    InvalidRequest,
    /// Provider answered but the body could not be understood
    MalformedResponse,
}

impl LlmErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::RateLimited | Self::Transient | Self::MalformedResponse
        )
    }
}

impl fmt::Display for LlmErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::RateLimited => "rate limited",
            Self::Transient => "transient",
            Self::Auth => "auth",
            Self::InvalidRequest => "invalid request",
            Self::MalformedResponse => "malformed response",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
#[error("LLM error ({kind}): {message}")]
pub struct LlmError {
    pub kind: LlmErrorKind,
    pub message: String,
}

impl LlmError {
    pub fn new(kind: LlmErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        let kind = if e.is_decode() {
            LlmErrorKind::MalformedResponse
        } else if let Some(status) = e.status() {
            classify_http_status(status.as_u16())
        } else {
            LlmErrorKind::Transient
        };
        Self::new(kind, e.to_string())
    }
}

/// Map an HTTP status code to an error kind.
pub fn classify_http_status(status: u16) -> LlmErrorKind {
    match status {
        429 => LlmErrorKind::RateLimited,
        401 | 403 => LlmErrorKind::Auth,
        400 | 404 | 413 | 422 => LlmErrorKind::InvalidRequest,
        408 | 500..=599 => LlmErrorKind::Transient,
        _ => LlmErrorKind::InvalidRequest,
    }
}
