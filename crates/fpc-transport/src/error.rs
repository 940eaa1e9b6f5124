use std::fmt;

/// Which part of the exchange ran out of time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPhase {
    /// Resolving or connecting. Nothing reached the server.
    Connect,
    /// Waiting for or reading the response. The server may have acted on
    /// the request.
    Read,
}

impl fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect => f.write_str("connect"),
            Self::Read => f.write_str("read"),
        }
    }
}

/// Transport failure, classified for retry decisions.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Request timed out ({phase}): {message}")]
    Timeout { phase: TimeoutPhase, message: String },

    #[error("Connection failed: {0}")]
    Connection(String),

    /// Not worth retrying: bad URL, TLS setup, protocol errors.
    #[error("Request failed: {0}")]
    Fatal(String),
}

impl TransportError {
    /// Timeouts and connection failures may succeed on another attempt.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Connection(_))
    }

    /// The request went out but the response did not arrive in time.
    #[must_use]
    pub fn is_read_timeout(&self) -> bool {
        matches!(
            self,
            Self::Timeout {
                phase: TimeoutPhase::Read,
                ..
            }
        )
    }
}

impl From<ureq::Error> for TransportError {
    fn from(err: ureq::Error) -> Self {
        let message = err.to_string();
        match err {
            ureq::Error::Timeout(ureq::Timeout::Resolve | ureq::Timeout::Connect) => Self::Timeout {
                phase: TimeoutPhase::Connect,
                message,
            },
            ureq::Error::Timeout(_) => Self::Timeout {
                phase: TimeoutPhase::Read,
                message,
            },
            ureq::Error::ConnectionFailed | ureq::Error::HostNotFound | ureq::Error::Io(_) => {
                Self::Connection(message)
            }
            _ => Self::Fatal(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let read = TransportError::Timeout {
            phase: TimeoutPhase::Read,
            message: "recv".to_owned(),
        };
        let connect = TransportError::Timeout {
            phase: TimeoutPhase::Connect,
            message: "connect".to_owned(),
        };

        assert!(read.is_retryable());
        assert!(read.is_read_timeout());
        assert!(connect.is_retryable());
        assert!(!connect.is_read_timeout());
        assert!(TransportError::Connection("refused".to_owned()).is_retryable());
        assert!(!TransportError::Fatal("bad uri".to_owned()).is_retryable());
    }

    #[test]
    fn test_from_ureq_error() {
        assert!(TransportError::from(ureq::Error::Timeout(ureq::Timeout::Connect)).is_retryable());
        assert!(
            TransportError::from(ureq::Error::Timeout(ureq::Timeout::RecvResponse))
                .is_read_timeout()
        );
        assert_eq!(
            TransportError::from(ureq::Error::HostNotFound),
            TransportError::Connection(ureq::Error::HostNotFound.to_string())
        );
        assert!(matches!(
            TransportError::from(ureq::Error::BadUri("x".to_owned())),
            TransportError::Fatal(_)
        ));
    }

    #[test]
    fn test_display() {
        let err = TransportError::Timeout {
            phase: TimeoutPhase::Read,
            message: "timeout: recv_response".to_owned(),
        };

        assert_eq!(
            err.to_string(),
            "Request timed out (read): timeout: recv_response"
        );
    }
}
