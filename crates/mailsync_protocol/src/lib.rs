//! # MailSync Protocol
//!
//! Event-log protocol types and CBOR codecs for MailSync.
//!
//! This crate provides:
//! - [`AccountId`], [`Cursor`] and the explicit [`CursorState`]
//! - [`EventRecord`] change records and the decoded [`EventBatch`]
//! - Wire messages for the latest-cursor and events endpoints
//! - CBOR encoding/decoding via [`WireMessage`]
//! - Canonical response codes and refresh flags
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod codec;
mod cursor;
mod error;
mod event;
mod messages;

pub use codec::WireMessage;
pub use cursor::{AccountId, Cursor, CursorState};
pub use error::{ProtocolError, ProtocolResult};
pub use event::{EventAction, EventBatch, EventRecord, TargetType};
pub use messages::{
    refresh, EventsRequest, EventsResponse, LatestCursorRequest, LatestCursorResponse,
    RESPONSE_CODE_INTERNAL, RESPONSE_CODE_INVALID_CURSOR, RESPONSE_CODE_OK,
    RESPONSE_CODE_UNAUTHORIZED, RESPONSE_CODE_UNKNOWN_ACCOUNT,
};
