//! Result and error types for Cosecha.

use std::time::Duration;
use thiserror::Error;

/// Result type for coverage collection operations
pub type CollectResult<T> = Result<T, CollectError>;

/// Errors that can occur while collecting coverage
#[derive(Debug, Error)]
pub enum CollectError {
    /// The service endpoint URI could not be interpreted
    #[error("Malformed service endpoint: {uri}")]
    MalformedEndpoint {
        /// The URI as supplied by the caller
        uri: String,
    },

    /// The VM service is unreachable or its liveness probe went unanswered
    #[error("Failed to reach VM service: {message}")]
    Connection {
        /// Error message
        message: String,
    },

    /// Overall deadline exceeded during connect or wait-for-paused
    #[error("Timed out after {elapsed:?}")]
    Timeout {
        /// How long the attempt ran before giving up
        elapsed: Duration,
    },

    /// Not every isolate has reached a paused state yet
    ///
    /// Transient by design: the wait-for-paused poll swallows this until
    /// the overall deadline degrades it to [`CollectError::Timeout`].
    #[error("{remaining} isolate(s) not yet paused")]
    UnpausedRemaining {
        /// Number of isolates still running
        remaining: usize,
    },

    /// The VM service reported a failure during active collection
    #[error("VM service error: {message}")]
    Service {
        /// Error message
        message: String,
    },

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_display_carries_elapsed() {
        let err = CollectError::Timeout {
            elapsed: Duration::from_millis(500),
        };
        assert!(format!("{err}").contains("500ms"));
    }

    #[test]
    fn test_unpaused_remaining_display() {
        let err = CollectError::UnpausedRemaining { remaining: 3 };
        assert_eq!(format!("{err}"), "3 isolate(s) not yet paused");
    }

    #[test]
    fn test_malformed_endpoint_display() {
        let err = CollectError::MalformedEndpoint {
            uri: "nonsense".to_string(),
        };
        assert!(format!("{err}").contains("nonsense"));
    }
}
