//! Error types for the sync engine.

use mailsync_protocol::{ProtocolError, RESPONSE_CODE_INTERNAL};
use mailsync_storage::StorageError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
///
/// Staging rejections are deliberately absent: a batch that fails staging
/// halts the cycle without advancing the cursor and is reported through
/// logs and [`crate::CycleResult::staging_rejected`], never as an error.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The server answered with a status other than the success code.
    #[error("remote error {code}: {message}")]
    Remote {
        /// Server status code.
        code: u32,
        /// Server-provided message.
        message: String,
    },

    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Protocol error (invalid message format).
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Cursor storage is unavailable.
    #[error("cursor storage error: {0}")]
    Storage(#[from] StorageError),

    /// Committing a staged batch to local state failed.
    #[error("local write failed: {0}")]
    Write(String),

    /// A refresh of local state failed.
    #[error("event handler error: {0}")]
    Handler(String),

    /// Sync was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// Invalid handler state transition.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },

    /// Timeout.
    #[error("operation timed out")]
    Timeout,

    /// Not connected.
    #[error("not connected to server")]
    NotConnected,
}

impl SyncError {
    /// Creates a remote error from a server status and message.
    pub fn remote(code: u32, message: impl Into<String>) -> Self {
        Self::Remote {
            code,
            message: message.into(),
        }
    }

    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates a local write error.
    pub fn write(message: impl Into<String>) -> Self {
        Self::Write(message.into())
    }

    /// Creates a handler error.
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler(message.into())
    }

    /// Returns true if repeating the same request may succeed.
    ///
    /// Server-side internal failures count; rejections of the request do not.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Remote { code, .. } => *code == RESPONSE_CODE_INTERNAL,
            SyncError::Timeout | SyncError::NotConnected => true,
            _ => false,
        }
    }

    /// Returns the server status code for remote errors.
    pub fn remote_code(&self) -> Option<u32> {
        match self {
            SyncError::Remote { code, .. } => Some(*code),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::transport_retryable("connection reset").is_retryable());
        assert!(!SyncError::transport_fatal("bad certificate").is_retryable());
        assert!(SyncError::Timeout.is_retryable());
        assert!(!SyncError::remote(2001, "invalid cursor").is_retryable());
        assert!(SyncError::remote(2500, "log unavailable").is_retryable());
        assert!(!SyncError::write("disk full").is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
    }

    #[test]
    fn error_display() {
        let err = SyncError::remote(2002, "unknown account");
        assert_eq!(err.to_string(), "remote error 2002: unknown account");
        assert_eq!(err.remote_code(), Some(2002));

        let err = SyncError::InvalidStateTransition {
            from: "Idle".into(),
            to: "Applying".into(),
        };
        assert!(err.to_string().contains("Idle"));
        assert!(err.to_string().contains("Applying"));
    }

    #[test]
    fn storage_errors_convert() {
        let err: SyncError = StorageError::corrupted("bad map").into();
        assert!(matches!(err, SyncError::Storage(_)));
    }
}
