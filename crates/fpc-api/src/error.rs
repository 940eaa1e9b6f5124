//! Error types for remote cache service calls.

use fpc_backlog::BacklogError;
use fpc_transport::{Response, ResponseStatus, TransportError};

/// Error from a remote cache service call.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The service is known to be down or answered 503. Callers fall back to
    /// local-only work.
    #[error("Service unavailable: {0}")]
    ServiceDown(String),

    /// Every attempt failed before a response arrived.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The service rejected the request.
    #[error("{context}: {status} {message}")]
    Status {
        context: &'static str,
        status: u16,
        message: String,
    },

    /// The response body was not the expected JSON.
    #[error("Invalid response")]
    Json(#[from] serde_json::Error),

    /// Recording the request in the backlog failed.
    #[error(transparent)]
    Backlog(#[from] BacklogError),

    /// The worker pool for a batch could not be started.
    #[error("Failed to start worker pool: {0}")]
    Pool(String),
}

impl ApiError {
    /// Error for a response that is not OK. A 503 means the service is down.
    #[must_use]
    pub fn from_response(response: &Response, context: &'static str) -> Self {
        let message = response.error_message();
        if response.status() == ResponseStatus::ServiceUnavailable {
            return Self::ServiceDown(format!("{context}: {message}"));
        }
        Self::Status {
            context,
            status: response.code,
            message,
        }
    }

    #[must_use]
    pub fn is_service_down(&self) -> bool {
        matches!(self, Self::ServiceDown(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_from_response_classifies_503() {
        let down = ApiError::from_response(&Response::new(503), "Error while purging cache");
        let rejected = ApiError::from_response(
            &Response::new(400).with_body(r#"{"error": "Invalid URL"}"#),
            "Error while purging cache",
        );

        assert!(down.is_service_down());
        assert_eq!(
            rejected.to_string(),
            "Error while purging cache: 400 Invalid URL"
        );
        assert!(!rejected.is_service_down());
    }
}
