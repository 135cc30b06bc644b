//! Network error codes
//!
//! Every asynchronous failure in the crate is delivered to the original
//! handler as one of these values. None of them is retried here.

use std::io;
use thiserror::Error;

/// Result alias for network operations
pub type NetworkResult<T> = Result<T, NetworkError>;

/// Connection lifecycle and channel errors
///
/// Cloneable so that a single stop code can be fanned out to every
/// subscriber of a channel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("Resolve failed: {0}")]
    ResolveFailure(String),
    #[error("Connect failed: {0}")]
    ConnectFailure(String),
    #[error("Connect timed out")]
    ConnectTimeout,
    #[error("Listen failed: {0}")]
    ListenFailure(String),
    #[error("Accept failed: {0}")]
    AcceptFailure(String),
    #[error("Operation canceled")]
    OperationCanceled,
    #[error("Channel stopped")]
    ChannelStopped,
    #[error("Malformed message: {0}")]
    MalformedMessage(String),
    #[error("Bad stream: {0}")]
    BadStream(String),
}

impl NetworkError {
    /// Whether this code reports a cancellation rather than a failure
    pub fn is_canceled(&self) -> bool {
        matches!(self, NetworkError::OperationCanceled)
    }
}

impl From<io::Error> for NetworkError {
    fn from(e: io::Error) -> Self {
        NetworkError::BadStream(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(NetworkError::ConnectTimeout.to_string(), "Connect timed out");
        assert_eq!(
            NetworkError::ListenFailure("address in use".to_string()).to_string(),
            "Listen failed: address in use"
        );
    }

    #[test]
    fn test_io_error_maps_to_bad_stream() {
        let e: NetworkError = io::Error::new(io::ErrorKind::BrokenPipe, "pipe").into();
        assert!(matches!(e, NetworkError::BadStream(_)));
        assert!(!e.is_canceled());
        assert!(NetworkError::OperationCanceled.is_canceled());
    }
}
