//! Change records and decoded event batches.

use crate::cursor::Cursor;
use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};

/// Kind of object a change record targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum TargetType {
    /// A single message.
    Message,
    /// A conversation (thread).
    Conversation,
    /// A label or folder.
    Label,
    /// A contact card.
    Contact,
    /// An email address belonging to a contact.
    ContactEmail,
    /// One of the account's own sending addresses.
    Address,
}

impl TargetType {
    /// Converts to the wire code.
    pub fn to_code(self) -> u8 {
        match self {
            TargetType::Message => 1,
            TargetType::Conversation => 2,
            TargetType::Label => 3,
            TargetType::Contact => 4,
            TargetType::ContactEmail => 5,
            TargetType::Address => 6,
        }
    }

    /// Converts from a wire code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(TargetType::Message),
            2 => Some(TargetType::Conversation),
            3 => Some(TargetType::Label),
            4 => Some(TargetType::Contact),
            5 => Some(TargetType::ContactEmail),
            6 => Some(TargetType::Address),
            _ => None,
        }
    }

    /// Returns true for contact data, which a contacts-only refresh replaces.
    pub fn is_contact_data(self) -> bool {
        matches!(self, TargetType::Contact | TargetType::ContactEmail)
    }
}

impl From<TargetType> for u8 {
    fn from(target: TargetType) -> Self {
        target.to_code()
    }
}

impl TryFrom<u8> for TargetType {
    type Error = ProtocolError;

    fn try_from(code: u8) -> ProtocolResult<Self> {
        Self::from_code(code)
            .ok_or_else(|| ProtocolError::invalid_field("target", format!("unknown code {code}")))
    }
}

/// Operation a change record performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum EventAction {
    /// The target was deleted.
    Delete,
    /// The target was created.
    Create,
    /// The target was updated.
    Update,
}

impl EventAction {
    /// Converts to the wire code.
    pub fn to_code(self) -> u8 {
        match self {
            EventAction::Delete => 0,
            EventAction::Create => 1,
            EventAction::Update => 2,
        }
    }

    /// Converts from a wire code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(EventAction::Delete),
            1 => Some(EventAction::Create),
            2 => Some(EventAction::Update),
            _ => None,
        }
    }
}

impl From<EventAction> for u8 {
    fn from(action: EventAction) -> Self {
        action.to_code()
    }
}

impl TryFrom<u8> for EventAction {
    type Error = ProtocolError;

    fn try_from(code: u8) -> ProtocolResult<Self> {
        Self::from_code(code)
            .ok_or_else(|| ProtocolError::invalid_field("action", format!("unknown code {code}")))
    }
}

/// A single change record from the remote event log.
///
/// # Fields
///
/// - `target`: kind of object changed
/// - `target_id`: remote identifier of the object
/// - `action`: create, update or delete
/// - `payload`: serialized object for create/update, absent for delete
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Kind of object.
    pub target: TargetType,
    /// Remote identifier.
    pub target_id: String,
    /// Operation.
    pub action: EventAction,
    /// Object payload (create/update only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Vec<u8>>,
}

impl EventRecord {
    /// Creates a create record.
    pub fn create(target: TargetType, target_id: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            target,
            target_id: target_id.into(),
            action: EventAction::Create,
            payload: Some(payload),
        }
    }

    /// Creates an update record.
    pub fn update(target: TargetType, target_id: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            target,
            target_id: target_id.into(),
            action: EventAction::Update,
            payload: Some(payload),
        }
    }

    /// Creates a delete record.
    pub fn delete(target: TargetType, target_id: impl Into<String>) -> Self {
        Self {
            target,
            target_id: target_id.into(),
            action: EventAction::Delete,
            payload: None,
        }
    }

    /// Checks the record's structure.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidField`] if the id is empty, a
    /// create/update has no payload, or a delete carries one.
    pub fn validate(&self) -> ProtocolResult<()> {
        if self.target_id.is_empty() {
            return Err(ProtocolError::invalid_field("target_id", "must not be empty"));
        }
        match (self.action, &self.payload) {
            (EventAction::Create | EventAction::Update, None) => Err(
                ProtocolError::invalid_field("payload", format!("{:?} needs a payload", self.action)),
            ),
            (EventAction::Delete, Some(_)) => Err(ProtocolError::invalid_field(
                "payload",
                "delete must not carry a payload",
            )),
            _ => Ok(()),
        }
    }
}

/// One decoded page of the remote event log.
///
/// Created per fetch and consumed immediately; only `next_cursor` outlives it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventBatch {
    /// Change records in server order.
    pub events: Vec<EventRecord>,
    /// Cursor to persist once the events are applied.
    pub next_cursor: Cursor,
    /// More pages are pending after this one.
    pub has_more: bool,
    /// Local state must be rebuilt from scratch.
    pub force_full_refresh: bool,
    /// Contact data must be reloaded.
    pub contacts_changed: bool,
}

impl EventBatch {
    /// Creates a final page with no refresh flags.
    pub fn new(events: Vec<EventRecord>, next_cursor: Cursor) -> Self {
        Self {
            events,
            next_cursor,
            has_more: false,
            force_full_refresh: false,
            contacts_changed: false,
        }
    }

    /// Sets whether more pages follow.
    pub fn with_more(mut self, has_more: bool) -> Self {
        self.has_more = has_more;
        self
    }

    /// Marks the batch as requiring a full refresh.
    pub fn with_full_refresh(mut self) -> Self {
        self.force_full_refresh = true;
        self
    }

    /// Marks contact data as changed.
    pub fn with_contacts_changed(mut self) -> Self {
        self.contacts_changed = true;
        self
    }
}
