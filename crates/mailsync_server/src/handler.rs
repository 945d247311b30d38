//! Request handlers for the event-log endpoints.

use crate::auth::{AuthConfig, TokenValidator};
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::eventlog::EventLog;
use mailsync_protocol::{
    AccountId, EventsRequest, EventsResponse, LatestCursorRequest, LatestCursorResponse,
};
use std::sync::Arc;
use tracing::{debug, warn};

/// Context for request handling.
pub struct HandlerContext {
    /// Server configuration.
    pub config: ServerConfig,
    /// Event logs (shared across all handlers).
    pub log: Arc<EventLog>,
    validator: Option<TokenValidator>,
}

impl HandlerContext {
    /// Creates a new handler context.
    pub fn new(config: ServerConfig, log: Arc<EventLog>) -> Self {
        let validator = match (&config.auth_secret, config.require_auth) {
            (Some(secret), true) => Some(TokenValidator::new(
                AuthConfig::new(secret.clone()).with_expiry(config.token_expiry),
            )),
            _ => None,
        };
        Self {
            config,
            log,
            validator,
        }
    }

    /// Returns the token validator when authentication is enabled.
    pub fn validator(&self) -> Option<&TokenValidator> {
        self.validator.as_ref()
    }

    fn authorize(&self, account: &AccountId, token: Option<&[u8]>) -> ServerResult<()> {
        if !self.config.require_auth {
            return Ok(());
        }
        let validator = self
            .validator
            .as_ref()
            .ok_or_else(|| ServerError::Internal("authentication enabled without secret".into()))?;
        let token = token.ok_or_else(|| ServerError::NotAuthorized("missing token".into()))?;
        validator.validate_token(token, account)
    }
}

/// Handler for event-log requests.
///
/// Errors never escape as `Err`: they are answered with the matching
/// response code so that clients see them on the wire.
pub struct RequestHandler {
    context: Arc<HandlerContext>,
}

impl RequestHandler {
    /// Creates a new request handler.
    pub fn new(context: Arc<HandlerContext>) -> Self {
        Self { context }
    }

    /// Handles a latest-cursor request.
    pub fn handle_latest(&self, request: LatestCursorRequest) -> LatestCursorResponse {
        let account = request.account_id.clone();
        match self.latest(request) {
            Ok(response) => response,
            Err(e) => {
                warn!(%account, error = %e, "latest cursor request failed");
                LatestCursorResponse::error(e.response_code(), e.to_string())
            }
        }
    }

    fn latest(&self, request: LatestCursorRequest) -> ServerResult<LatestCursorResponse> {
        self.context
            .authorize(&request.account_id, request.auth_token.as_deref())?;
        let cursor = self.context.log.latest(&request.account_id)?;
        debug!(account = %request.account_id, %cursor, "latest cursor served");
        Ok(LatestCursorResponse::success(cursor.as_str()))
    }

    /// Handles an events request.
    pub fn handle_events(&self, request: EventsRequest) -> EventsResponse {
        let account = request.account_id.clone();
        match self.events(request) {
            Ok(response) => response,
            Err(e) => {
                warn!(%account, error = %e, "events request failed");
                EventsResponse::error(e.response_code(), e.to_string())
            }
        }
    }

    fn events(&self, request: EventsRequest) -> ServerResult<EventsResponse> {
        self.context
            .authorize(&request.account_id, request.auth_token.as_deref())?;
        let limit = self.context.config.max_page_size as usize;
        let page = self
            .context
            .log
            .page(&request.account_id, request.cursor.as_deref(), limit)?;
        debug!(
            account = %request.account_id,
            events = page.events.len(),
            next = %page.next,
            more = page.more,
            "events page served"
        );
        Ok(EventsResponse::page(page.next.as_str(), page.events, page.more).with_refresh(page.refresh))
    }
}
