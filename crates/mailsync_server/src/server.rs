//! Event-log server.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::eventlog::EventLog;
use crate::handler::{HandlerContext, RequestHandler};
use mailsync_protocol::{
    AccountId, Cursor, EventRecord, EventsRequest, EventsResponse, LatestCursorRequest,
    LatestCursorResponse, WireMessage,
};
use std::sync::Arc;

/// Path of the latest-cursor endpoint.
pub const LATEST_CURSOR_PATH: &str = "/events/latest";
/// Path of the events endpoint.
pub const EVENTS_PATH: &str = "/events";

/// The reference event-log server.
///
/// It keeps one event log per account in memory and answers the
/// latest-cursor and events endpoints with CBOR bodies. Test code feeds the
/// logs through [`append_event`](Self::append_event) and friends.
///
/// # Example
///
/// ```
/// use mailsync_protocol::{AccountId, EventRecord, TargetType};
/// use mailsync_server::{EventServer, ServerConfig};
///
/// let server = EventServer::new(ServerConfig::default());
/// let account = AccountId::from("u1");
/// server
///     .append_event(&account, EventRecord::create(TargetType::Message, "m1", vec![1]))
///     .unwrap();
/// assert_eq!(server.latest(&account).unwrap().as_str(), "E1");
/// ```
pub struct EventServer {
    handler: RequestHandler,
    context: Arc<HandlerContext>,
}

impl EventServer {
    /// Creates a new server.
    pub fn new(config: ServerConfig) -> Self {
        let log = Arc::new(EventLog::with_retention(config.retain_events));
        Self::with_log(config, log)
    }

    /// Creates a server over an existing log.
    pub fn with_log(config: ServerConfig, log: Arc<EventLog>) -> Self {
        let context = Arc::new(HandlerContext::new(config, log));
        let handler = RequestHandler::new(Arc::clone(&context));

        Self { handler, context }
    }

    /// Returns the event log.
    pub fn log(&self) -> &Arc<EventLog> {
        &self.context.log
    }

    /// Handles a latest-cursor request.
    pub fn handle_latest(&self, request: LatestCursorRequest) -> LatestCursorResponse {
        self.handler.handle_latest(request)
    }

    /// Handles an events request.
    pub fn handle_events(&self, request: EventsRequest) -> EventsResponse {
        self.handler.handle_events(request)
    }

    /// Decodes a CBOR request posted to `path`, dispatches it, and encodes
    /// the response.
    pub fn handle_post(&self, path: &str, body: &[u8]) -> ServerResult<Vec<u8>> {
        match path {
            LATEST_CURSOR_PATH => {
                let request = LatestCursorRequest::decode(body)?;
                Ok(self.handle_latest(request).encode()?)
            }
            EVENTS_PATH => {
                let request = EventsRequest::decode(body)?;
                Ok(self.handle_events(request).encode()?)
            }
            other => Err(ServerError::InvalidRequest(format!("no endpoint at {other}"))),
        }
    }

    /// Creates the log of `account` if needed.
    pub fn create_account(&self, account: &AccountId) -> ServerResult<Cursor> {
        self.context.log.create_account(account)
    }

    /// Appends an event to `account`'s log.
    pub fn append_event(&self, account: &AccountId, event: EventRecord) -> ServerResult<Cursor> {
        self.context.log.append(account, event)
    }

    /// Flags the next page of `account` with refresh bits.
    pub fn request_refresh(&self, account: &AccountId, flags: u8) -> ServerResult<()> {
        self.context.log.request_refresh(account, flags)
    }

    /// Drops all but the newest `keep` events of `account`.
    pub fn compact(&self, account: &AccountId, keep: usize) -> ServerResult<usize> {
        self.context.log.compact(account, keep)
    }

    /// Returns the newest cursor of `account`.
    pub fn latest(&self, account: &AccountId) -> ServerResult<Cursor> {
        self.context.log.latest(account)
    }

    /// Issues a token for `account`.
    ///
    /// # Errors
    ///
    /// Returns an error if authentication is disabled.
    pub fn issue_token(&self, account: &AccountId) -> ServerResult<Vec<u8>> {
        self.context
            .validator()
            .ok_or_else(|| ServerError::InvalidRequest("authentication is disabled".into()))?
            .create_token(account)
    }
}
