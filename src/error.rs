//! Error types for settings client operations
//!
//! This module defines the error taxonomy shared by the read and write paths.
//! `404` and `304` are not errors: they resolve to `Ok(None)` and to a cache
//! hit respectively. Errors are `Clone` so a single in-flight request can hand
//! the same outcome to every caller that joined it.

use crate::mutation::ConflictReport;
use thiserror::Error;

/// Main error type for settings client operations
#[derive(Error, Debug, Clone)]
pub enum ClientError {
    /// Network failure, timeout, or a response body that could not be parsed
    #[error("Transport error: {0}")]
    Transport(String),

    /// Server answered with a status outside the expected set
    #[error("Unexpected status {status}: {context}")]
    UnexpectedStatus { status: u16, context: String },

    /// Server answered `304 Not Modified` but nothing was cached for the key
    #[error("Received 304 Not Modified without a cached value for {0}")]
    CacheMiss(String),

    /// Optimistic concurrency conflict that automatic recovery could not resolve
    #[error(
        "Precondition failed for {} after {} attempt(s)",
        .0.resource_id,
        .0.attempts
    )]
    PreconditionFailed(Box<ConflictReport>),

    /// Write rejected by the server with a non-retryable 4xx status
    #[error("Validation error ({status}): {detail}")]
    Validation { status: u16, detail: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Request payload could not be encoded
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl ClientError {
    /// Whether prompting the user for a manual retry makes sense
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Transport(_) | ClientError::PreconditionFailed(_) => true,
            ClientError::UnexpectedStatus { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Returns the conflict report for an unresolved optimistic concurrency conflict
    pub fn conflict(&self) -> Option<&ConflictReport> {
        match self {
            ClientError::PreconditionFailed(report) => Some(report.as_ref()),
            _ => None,
        }
    }
}

/// Result type alias for settings client operations
pub type Result<T> = std::result::Result<T, ClientError>;

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        ClientError::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        ClientError::Serialization(e.to_string())
    }
}
