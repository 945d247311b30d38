//! Protocol messages for the event-log endpoints.

use crate::codec::WireMessage;
use crate::cursor::{AccountId, Cursor};
use crate::error::{ProtocolError, ProtocolResult};
use crate::event::{EventBatch, EventRecord};
use serde::{Deserialize, Serialize};

/// The only code that marks a successful response.
pub const RESPONSE_CODE_OK: u32 = 1000;
/// The cursor in the request is unknown to the server.
pub const RESPONSE_CODE_INVALID_CURSOR: u32 = 2001;
/// The account in the request is unknown to the server.
pub const RESPONSE_CODE_UNKNOWN_ACCOUNT: u32 = 2002;
/// The request carried no valid credentials.
pub const RESPONSE_CODE_UNAUTHORIZED: u32 = 401;
/// The server failed while handling the request.
pub const RESPONSE_CODE_INTERNAL: u32 = 2500;

/// Bits of [`EventsResponse::refresh`].
pub mod refresh {
    /// Nothing to refresh.
    pub const NONE: u8 = 0;
    /// Mailbox state must be rebuilt.
    pub const MAIL: u8 = 1;
    /// Contact data must be reloaded.
    pub const CONTACTS: u8 = 2;
    /// Everything must be rebuilt.
    pub const ALL: u8 = 255;
}

/// Request for the newest cursor of an account (bootstrap only).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatestCursorRequest {
    /// Account whose log is addressed.
    pub account_id: AccountId,
    /// Credentials, when the server requires them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<Vec<u8>>,
}

impl LatestCursorRequest {
    /// Creates an unauthenticated request.
    pub fn new(account_id: AccountId) -> Self {
        Self {
            account_id,
            auth_token: None,
        }
    }

    /// Attaches credentials.
    pub fn with_auth_token(mut self, token: Vec<u8>) -> Self {
        self.auth_token = Some(token);
        self
    }
}

/// Response carrying the newest cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatestCursorResponse {
    /// Status code; only [`RESPONSE_CODE_OK`] is success.
    pub code: u32,
    /// Server message for failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Newest cursor of the account's log.
    #[serde(default)]
    pub event_id: String,
}

impl LatestCursorResponse {
    /// Creates a successful response.
    pub fn success(event_id: impl Into<String>) -> Self {
        Self {
            code: RESPONSE_CODE_OK,
            error: None,
            event_id: event_id.into(),
        }
    }

    /// Creates a failed response.
    pub fn error(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            error: Some(message.into()),
            event_id: String::new(),
        }
    }

    /// Returns the cursor.
    ///
    /// # Errors
    ///
    /// Returns an error if the event id is empty.
    pub fn cursor(&self) -> ProtocolResult<Cursor> {
        Cursor::new(self.event_id.clone())
    }
}

/// Request for the page of events after a cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventsRequest {
    /// Account whose log is addressed.
    pub account_id: AccountId,
    /// Cursor to continue from; `None` asks for the log from its start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    /// Credentials, when the server requires them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<Vec<u8>>,
}

impl EventsRequest {
    /// Creates an unauthenticated request after `cursor`.
    pub fn new(account_id: AccountId, cursor: Option<&Cursor>) -> Self {
        Self {
            account_id,
            cursor: cursor.map(|c| c.as_str().to_string()),
            auth_token: None,
        }
    }

    /// Attaches credentials.
    pub fn with_auth_token(mut self, token: Vec<u8>) -> Self {
        self.auth_token = Some(token);
        self
    }
}

/// One page of the event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventsResponse {
    /// Status code; only [`RESPONSE_CODE_OK`] is success.
    pub code: u32,
    /// Server message for failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Cursor following the last event of this page.
    #[serde(default)]
    pub event_id: String,
    /// More pages are pending.
    #[serde(default)]
    pub more: bool,
    /// Refresh bitmask, see [`refresh`].
    #[serde(default)]
    pub refresh: u8,
    /// Change records in log order.
    #[serde(default)]
    pub events: Vec<EventRecord>,
}

impl EventsResponse {
    /// Creates a successful page.
    pub fn page(event_id: impl Into<String>, events: Vec<EventRecord>, more: bool) -> Self {
        Self {
            code: RESPONSE_CODE_OK,
            error: None,
            event_id: event_id.into(),
            more,
            refresh: refresh::NONE,
            events,
        }
    }

    /// Creates a failed response.
    pub fn error(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            error: Some(message.into()),
            event_id: String::new(),
            more: false,
            refresh: refresh::NONE,
            events: Vec::new(),
        }
    }

    /// Sets refresh bits.
    pub fn with_refresh(mut self, flags: u8) -> Self {
        self.refresh |= flags;
        self
    }

    /// Returns true if the mailbox must be rebuilt.
    pub fn refresh_mail(&self) -> bool {
        self.refresh & refresh::MAIL != 0
    }

    /// Returns true if contact data must be reloaded.
    pub fn refresh_contacts(&self) -> bool {
        self.refresh & refresh::CONTACTS != 0
    }

    /// Converts a successful page into an [`EventBatch`].
    ///
    /// The status code is not checked here; callers compare it against their
    /// configured success code first.
    ///
    /// # Errors
    ///
    /// Returns an error if the page carries no next cursor.
    pub fn into_batch(self) -> ProtocolResult<EventBatch> {
        let force_full_refresh = self.refresh_mail();
        let contacts_changed = self.refresh_contacts();
        let next_cursor = Cursor::new(self.event_id)
            .map_err(|_| ProtocolError::invalid_field("event_id", "page has no next cursor"))?;

        Ok(EventBatch {
            events: self.events,
            next_cursor,
            has_more: self.more,
            force_full_refresh,
            contacts_changed,
        })
    }
}

impl WireMessage for LatestCursorRequest {}
impl WireMessage for LatestCursorResponse {}
impl WireMessage for EventsRequest {}
impl WireMessage for EventsResponse {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::TargetType;

    #[test]
    fn events_response_roundtrip() {
        let response = EventsResponse::page(
            "E2",
            vec![
                EventRecord::create(TargetType::Message, "X", vec![1, 2, 3]),
                EventRecord::delete(TargetType::Label, "L"),
            ],
            true,
        )
        .with_refresh(refresh::CONTACTS);

        let bytes = response.encode().unwrap();
        let decoded = EventsResponse::decode(&bytes).unwrap();
        assert_eq!(decoded, response);
    }

    #[test]
    fn refresh_bits_map_to_batch_flags() {
        let batch = EventsResponse::page("E3", vec![], false)
            .with_refresh(refresh::ALL)
            .into_batch()
            .unwrap();
        assert!(batch.force_full_refresh);
        assert!(batch.contacts_changed);

        let batch = EventsResponse::page("E3", vec![], true)
            .with_refresh(refresh::CONTACTS)
            .into_batch()
            .unwrap();
        assert!(!batch.force_full_refresh);
        assert!(batch.contacts_changed);
        assert!(batch.has_more);
    }

    #[test]
    fn page_without_cursor_is_rejected() {
        let response = EventsResponse::page("", vec![], false);
        assert!(response.into_batch().is_err());
    }

    #[test]
    fn error_response_keeps_code_and_message() {
        let response = LatestCursorResponse::error(RESPONSE_CODE_UNKNOWN_ACCOUNT, "no such user");
        let decoded = LatestCursorResponse::decode(&response.encode().unwrap()).unwrap();
        assert_eq!(decoded.code, RESPONSE_CODE_UNKNOWN_ACCOUNT);
        assert_eq!(decoded.error.as_deref(), Some("no such user"));
        assert!(decoded.cursor().is_err());
    }

    #[test]
    fn unknown_action_code_fails_decoding() {
        #[derive(Serialize)]
        struct RawRecord {
            target: u8,
            target_id: &'static str,
            action: u8,
        }
        #[derive(Serialize)]
        struct RawResponse {
            code: u32,
            event_id: &'static str,
            events: Vec<RawRecord>,
        }

        let mut bytes = Vec::new();
        ciborium::into_writer(
            &RawResponse {
                code: RESPONSE_CODE_OK,
                event_id: "E1",
                events: vec![RawRecord {
                    target: 1,
                    target_id: "m",
                    action: 9,
                }],
            },
            &mut bytes,
        )
        .unwrap();

        assert!(matches!(
            EventsResponse::decode(&bytes),
            Err(ProtocolError::Decode(_))
        ));
    }

    #[test]
    fn request_carries_optional_cursor_and_token() {
        let cursor = Cursor::new("E9").unwrap();
        let request = EventsRequest::new(AccountId::from("u1"), Some(&cursor))
            .with_auth_token(vec![7; 4]);
        let decoded = EventsRequest::decode(&request.encode().unwrap()).unwrap();
        assert_eq!(decoded.cursor.as_deref(), Some("E9"));
        assert_eq!(decoded.auth_token, Some(vec![7; 4]));

        let bare = EventsRequest::new(AccountId::from("u1"), None);
        let decoded = EventsRequest::decode(&bare.encode().unwrap()).unwrap();
        assert_eq!(decoded.cursor, None);
    }
}
