//! Comms Error Types
//!
//! Error handling for the messaging runtime, the endpoint registrar, and the
//! remote ask gateway. Bootstrap failures are fatal and expected to abort
//! startup; everything the ask gateway returns is a typed condition the
//! caller can branch on (retry on transport faults, back off on timeouts,
//! escalate on remote failures).

use thiserror::Error;

/// Result type alias for comms operations.
pub type Result<T> = std::result::Result<T, CommsError>;

/// Main comms error type.
#[derive(Error, Debug)]
pub enum CommsError {
    /// Fatal startup errors: missing profile, bind failure, duplicate
    /// endpoint registration, double initialization.
    #[error("bootstrap error: {message}")]
    Bootstrap { message: String },

    /// The remote endpoint could not be reached or a message could not cross
    /// the transport boundary (connect, framing, serialization).
    #[error("transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// No reply arrived within the bounded wait.
    #[error("timeout: {operation} exceeded {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// The remote peer processed the request and explicitly reported failure.
    /// Carries the remote-supplied message verbatim.
    #[error("remote processing failed: {message}")]
    RemoteProcessing { message: String },
}

impl CommsError {
    /// Create a bootstrap error.
    pub fn bootstrap(message: impl Into<String>) -> Self {
        Self::Bootstrap {
            message: message.into(),
        }
    }

    /// Create a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            source: None,
        }
    }

    /// Create a transport error with source.
    pub fn transport_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transport {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a remote processing error.
    pub fn remote(message: impl Into<String>) -> Self {
        Self::RemoteProcessing {
            message: message.into(),
        }
    }

    /// Check if the caller may reasonably retry the operation.
    pub fn is_retryable(&self) -> bool {
        match self {
            CommsError::Transport { .. } => true,
            CommsError::Timeout { .. } => true,
            CommsError::Bootstrap { .. } => false,
            CommsError::RemoteProcessing { .. } => false,
        }
    }

    /// Get error category for logging and metrics.
    pub fn category(&self) -> &'static str {
        match self {
            CommsError::Bootstrap { .. } => "bootstrap",
            CommsError::Transport { .. } => "transport",
            CommsError::Timeout { .. } => "timeout",
            CommsError::RemoteProcessing { .. } => "remote_processing",
        }
    }
}

impl From<std::io::Error> for CommsError {
    fn from(error: std::io::Error) -> Self {
        CommsError::transport_with_source("socket i/o failed", error)
    }
}

impl From<serde_json::Error> for CommsError {
    fn from(error: serde_json::Error) -> Self {
        CommsError::transport_with_source("message serialization failed", error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_construction() {
        let err = CommsError::transport("connection refused");
        assert_eq!(err.category(), "transport");
        assert!(err.is_retryable());
    }

    #[test]
    fn test_error_categorization() {
        assert_eq!(CommsError::bootstrap("test").category(), "bootstrap");
        assert_eq!(CommsError::timeout("ask", 5000).category(), "timeout");
        assert_eq!(CommsError::remote("busy").category(), "remote_processing");
    }

    #[test]
    fn test_retryable_errors() {
        assert!(CommsError::transport("test").is_retryable());
        assert!(CommsError::timeout("ask", 5000).is_retryable());
        assert!(!CommsError::bootstrap("test").is_retryable());
        assert!(!CommsError::remote("busy").is_retryable());
    }

    #[test]
    fn test_remote_message_is_verbatim() {
        let err = CommsError::remote("busy");
        assert_eq!(err.to_string(), "remote processing failed: busy");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "test");
        let err = CommsError::from(io_err);

        match err {
            CommsError::Transport { source, .. } => assert!(source.is_some()),
            _ => panic!("expected Transport error"),
        }
    }
}
