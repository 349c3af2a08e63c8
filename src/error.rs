//! Error types for the relay engine.

use thiserror::Error;

/// Upstream error codes Feishu returns for an invalid or expired
/// tenant access token.
pub const UPSTREAM_TOKEN_INVALID: i64 = 99991663;
pub const UPSTREAM_TOKEN_EXPIRED: i64 = 99991664;

/// Errors produced by the relay core and its upstream API client.
#[derive(Error, Debug)]
pub enum RelayError {
    /// An error embedded in an upstream response body.
    #[error("upstream error ({code}): {message}")]
    Api {
        /// Numeric code from the response body.
        code: i64,
        /// Message from the response body.
        message: String,
        /// Transport-level HTTP status.
        status: u16,
    },

    /// An HTTP transport error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// A JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A persistence collaborator failure.
    #[error("store error: {0}")]
    Store(String),

    /// A malformed or undecryptable webhook payload.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// The response was missing an expected field.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl RelayError {
    /// Create a new upstream API error.
    pub fn api(code: i64, message: impl Into<String>, status: u16) -> Self {
        Self::Api {
            code,
            message: message.into(),
            status,
        }
    }

    /// True when upstream explicitly rejected our access token: HTTP
    /// 401/403 or one of the token-invalid body codes. Callers respond by
    /// invalidating the token cache before retrying.
    pub fn is_auth_rejection(&self) -> bool {
        match self {
            Self::Api { code, status, .. } => {
                matches!(status, 401 | 403)
                    || matches!(*code, UPSTREAM_TOKEN_INVALID | UPSTREAM_TOKEN_EXPIRED)
            }
            _ => false,
        }
    }

    /// True for transient upstream failures worth retrying without
    /// touching the token cache.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Api { status, .. } => (500..=599).contains(status),
            Self::Http(e) => e.is_connect() || e.is_timeout(),
            _ => false,
        }
    }

}

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;
