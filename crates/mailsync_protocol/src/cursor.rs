//! Account identifiers and sync cursors.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifier of a logged-in account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    /// Creates an account identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AccountId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for AccountId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Opaque continuation token marking how far local state reflects the
/// remote event log for one account.
///
/// A cursor is never empty; the empty string is reserved for the locked
/// marker (see [`CursorState::Locked`]).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Cursor(String);

impl Cursor {
    /// Creates a cursor from a non-empty token.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidField`] if `token` is empty.
    pub fn new(token: impl Into<String>) -> ProtocolResult<Self> {
        let token = token.into();
        if token.is_empty() {
            return Err(ProtocolError::invalid_field("cursor", "must not be empty"));
        }
        Ok(Self(token))
    }

    /// Returns the token as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Cursor {
    type Error = ProtocolError;

    fn try_from(token: String) -> ProtocolResult<Self> {
        Self::new(token)
    }
}

impl TryFrom<&str> for Cursor {
    type Error = ProtocolError;

    fn try_from(token: &str) -> ProtocolResult<Self> {
        Self::new(token)
    }
}

impl From<Cursor> for String {
    fn from(cursor: Cursor) -> Self {
        cursor.0
    }
}

/// Persisted sync position of one account.
///
/// `Absent` and `Locked` recover the same way (a full bootstrap); they are
/// kept apart so logs and results can tell "never synced" from "a refresh
/// was interrupted".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CursorState {
    /// No cursor was ever stored.
    Absent,
    /// A full refresh started and may not have finished.
    Locked,
    /// Local state reflects the remote log up to this cursor.
    Valid(Cursor),
}

impl CursorState {
    /// Interprets a raw stored value. The empty string is the locked marker.
    #[must_use]
    pub fn from_stored(stored: Option<String>) -> Self {
        match stored {
            None => CursorState::Absent,
            Some(token) if token.is_empty() => CursorState::Locked,
            Some(token) => CursorState::Valid(Cursor(token)),
        }
    }

    /// Returns the cursor if the state is valid.
    #[must_use]
    pub fn cursor(&self) -> Option<&Cursor> {
        match self {
            CursorState::Valid(cursor) => Some(cursor),
            _ => None,
        }
    }

    /// Returns true if the next sync must bootstrap.
    #[must_use]
    pub fn needs_bootstrap(&self) -> bool {
        !matches!(self, CursorState::Valid(_))
    }
}

impl fmt::Display for CursorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CursorState::Absent => f.write_str("absent"),
            CursorState::Locked => f.write_str("locked"),
            CursorState::Valid(cursor) => write!(f, "valid({cursor})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn non_empty_tokens_are_valid(token in "\\PC{1,40}") {
            let state = CursorState::from_stored(Some(token.clone()));
            prop_assert_eq!(state.cursor().map(Cursor::as_str), Some(token.as_str()));
        }
    }

    #[test]
    fn empty_cursor_is_rejected() {
        assert!(Cursor::new("").is_err());
        assert_eq!(Cursor::new("E1").unwrap().as_str(), "E1");
        assert!(Cursor::try_from("").is_err());
    }

    #[test]
    fn stored_values_map_to_states() {
        assert_eq!(CursorState::from_stored(None), CursorState::Absent);
        assert_eq!(
            CursorState::from_stored(Some(String::new())),
            CursorState::Locked
        );
        let valid = CursorState::from_stored(Some("E7".into()));
        assert_eq!(valid.cursor().map(Cursor::as_str), Some("E7"));
        assert!(!valid.needs_bootstrap());
        assert!(CursorState::Absent.needs_bootstrap());
        assert!(CursorState::Locked.needs_bootstrap());
    }

    #[test]
    fn display_forms() {
        assert_eq!(AccountId::from("u1").to_string(), "u1");
        assert_eq!(CursorState::Locked.to_string(), "locked");
        assert_eq!(
            CursorState::Valid(Cursor::new("E2").unwrap()).to_string(),
            "valid(E2)"
        );
    }
}
