//! Error types for followgraph
//!
//! Defines the crate-wide error enum. Expected mutation failures (a remote
//! refusing a follow) are not errors: they travel as `MutationOutcome`
//! values. This enum covers programmer errors and infrastructure failures.

use crate::remote::retry::{RetryDecision, RetryableError};
use std::time::Duration;
use thiserror::Error;

/// Result type alias for followgraph operations
pub type Result<T> = std::result::Result<T, FollowGraphError>;

/// Error type for followgraph operations
#[derive(Error, Debug)]
pub enum FollowGraphError {
    /// Malformed user id (empty or containing the key separator)
    #[error("Invalid user id: {0:?}")]
    InvalidUserId(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Persistence backend errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Network/transport errors talking to the follow backend
    #[error("Network error: {0}")]
    Network(String),

    /// Backend answered, but with an error status
    #[error("Remote error ({status}): {message}")]
    Remote { status: u16, message: String },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// SQLite database errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// HTTP request errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Other errors
    #[error("{0}")]
    Other(String),

    /// Anyhow errors (for more context)
    #[error("{0}")]
    Anyhow(#[from] anyhow::Error),
}

impl RetryableError for FollowGraphError {
    fn retry_decision(&self) -> RetryDecision {
        match self {
            FollowGraphError::Network(_) => RetryDecision::Retry,
            FollowGraphError::Http(e) => {
                if e.is_connect() || e.is_timeout() {
                    RetryDecision::Retry
                } else if let Some(status) = e.status() {
                    match status.as_u16() {
                        429 => RetryDecision::RetryAfter(Duration::from_secs(30)),
                        500..=599 => RetryDecision::Retry,
                        _ => RetryDecision::NoRetry,
                    }
                } else {
                    RetryDecision::Retry
                }
            }
            FollowGraphError::Remote { status, .. } => match status {
                429 => RetryDecision::RetryAfter(Duration::from_secs(30)),
                500..=599 => RetryDecision::Retry,
                _ => RetryDecision::NoRetry,
            },
            FollowGraphError::InvalidUserId(_)
            | FollowGraphError::Config(_)
            | FollowGraphError::Storage(_)
            | FollowGraphError::Io(_)
            | FollowGraphError::Json(_)
            | FollowGraphError::Yaml(_)
            | FollowGraphError::Database(_)
            | FollowGraphError::Other(_)
            | FollowGraphError::Anyhow(_) => RetryDecision::NoRetry,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert_eq!(
            FollowGraphError::Network("reset".into()).retry_decision(),
            RetryDecision::Retry
        );
        assert_eq!(
            FollowGraphError::Remote {
                status: 503,
                message: "unavailable".into()
            }
            .retry_decision(),
            RetryDecision::Retry
        );
        assert_eq!(
            FollowGraphError::Remote {
                status: 429,
                message: "slow down".into()
            }
            .retry_decision(),
            RetryDecision::RetryAfter(Duration::from_secs(30))
        );
        assert_eq!(
            FollowGraphError::InvalidUserId(String::new()).retry_decision(),
            RetryDecision::NoRetry
        );
    }

    #[test]
    fn test_display() {
        let err = FollowGraphError::Remote {
            status: 404,
            message: "no such rpc".into(),
        };
        assert_eq!(err.to_string(), "Remote error (404): no such rpc");
    }
}
