//! Error types for the event-log server.

use mailsync_protocol::{
    AccountId, ProtocolError, RESPONSE_CODE_INTERNAL, RESPONSE_CODE_INVALID_CURSOR,
    RESPONSE_CODE_UNAUTHORIZED, RESPONSE_CODE_UNKNOWN_ACCOUNT,
};
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the event-log server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Invalid request format.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Authentication failed.
    #[error("not authorized: {0}")]
    NotAuthorized(String),

    /// The account has no event log.
    #[error("unknown account: {0}")]
    UnknownAccount(AccountId),

    /// The cursor does not belong to the account's log.
    #[error("invalid cursor: {0}")]
    InvalidCursor(String),

    /// Request or response could not be coded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// Returns the wire response code for this error.
    pub fn response_code(&self) -> u32 {
        match self {
            ServerError::NotAuthorized(_) => RESPONSE_CODE_UNAUTHORIZED,
            ServerError::UnknownAccount(_) => RESPONSE_CODE_UNKNOWN_ACCOUNT,
            ServerError::InvalidCursor(_) => RESPONSE_CODE_INVALID_CURSOR,
            ServerError::InvalidRequest(_)
            | ServerError::Protocol(_)
            | ServerError::Internal(_) => RESPONSE_CODE_INTERNAL,
        }
    }

    /// Returns true if the client caused the error.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, ServerError::Internal(_))
    }
}
