//! Error taxonomy shared across the session core.
//!
//! Every variant is recoverable at the connection boundary: the server maps
//! them to an outbound `error` frame (or an HTTP status) and the session
//! keeps running. Nothing here is fatal to the process.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChatError {
    /// Rejected input (empty content, malformed frame).
    #[error("validation error: {0}")]
    Validation(String),

    /// Unknown session, conversation, or invocation id.
    #[error("not found: {0}")]
    NotFound(String),

    /// Operation not legal in the current state (decision on a settled
    /// invocation, turn submitted while one is streaming).
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Generator or tool executor failure. Marks the in-flight turn or
    /// invocation as failed without terminating the session.
    #[error("upstream error: {0}")]
    Upstream(String),
}

impl ChatError {
    pub fn validation(message: impl Into<String>) -> Self {
        ChatError::Validation(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        ChatError::NotFound(message.into())
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        ChatError::InvalidState(message.into())
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        ChatError::Upstream(message.into())
    }
}
