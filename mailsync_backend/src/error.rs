//! Error kinds shared by every collaborator call.
//!
//! Storage and startup plumbing use `anyhow`; calls that leave the process
//! (mail provider, text generation, chat delivery) return [`ServiceError`] so
//! callers can tell a retryable hiccup from a revoked credential.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServiceError {
    /// Network timeout, rate limit or 5xx. Retried by the caller's policy.
    #[error("transient failure: {0}")]
    Transient(String),
    /// Revoked credential or invalid subscription. Never retried.
    #[error("authorization failed: {0}")]
    Auth(String),
    /// The stored change cursor is too old for the provider to diff from.
    #[error("change cursor expired: {0}")]
    CursorExpired(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("{0}")]
    Permanent(String),
}

impl ServiceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ServiceError::Transient(_))
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, ServiceError::Auth(_))
    }

    /// Local storage failures end the current unit of work without retry.
    pub fn storage(error: anyhow::Error) -> Self {
        ServiceError::Permanent(format!("storage: {:#}", error))
    }

    /// Map a reqwest transport error. Anything that never reached the server,
    /// or timed out waiting for it, is transient.
    pub fn from_transport(context: &str, error: &reqwest::Error) -> Self {
        if error.is_timeout() || error.is_connect() || error.is_request() {
            ServiceError::Transient(format!("{}: {}", context, error))
        } else {
            ServiceError::Permanent(format!("{}: {}", context, error))
        }
    }

    /// Default status mapping for JSON APIs. Provider-specific quirks (such as
    /// Gmail's rate-limit 403) are handled by the caller before falling back here.
    pub fn from_status(context: &str, status: reqwest::StatusCode, body: &str) -> Self {
        let detail = format!("{} returned {}: {}", context, status, truncate(body, 300));
        match status.as_u16() {
            401 | 403 => ServiceError::Auth(detail),
            404 => ServiceError::NotFound(detail),
            408 | 429 => ServiceError::Transient(detail),
            code if code >= 500 => ServiceError::Transient(detail),
            _ => ServiceError::Permanent(detail),
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let mut out: String = text.chars().take(max_chars).collect();
        out.push('…');
        out
    }
}
